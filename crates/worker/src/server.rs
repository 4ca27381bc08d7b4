//! The worker's configure RPC surface, called by the allocator (or by the
//! API service in single-host mode over the in-process path).

use std::{
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    extract::State,
    routing::{
        get,
        post,
    },
    Router,
};
use common::http::{
    extract::Json,
    HttpResponseError,
    HttpServer,
};

use crate::{
    config::{
        ConfigureRequest,
        ConfigureResponse,
    },
    WorkerManager,
};

pub struct WorkerService {
    manager: Arc<WorkerManager>,
    server: HttpServer,
}

impl WorkerService {
    pub async fn start(manager: Arc<WorkerManager>, addr: SocketAddr) -> anyhow::Result<Self> {
        let server = HttpServer::bind("worker", worker_router(manager.clone()), addr).await?;
        Ok(Self { manager, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop taking pushes, then stop all instances and wait for their
    /// exits.
    pub async fn shutdown(self) {
        self.server.shutdown().await;
        self.manager.shutdown().await;
    }
}

pub fn worker_router(manager: Arc<WorkerManager>) -> Router {
    Router::new()
        .route("/configure", post(configure))
        .route("/health", get(health))
        .with_state(manager)
}

async fn configure(
    State(manager): State<Arc<WorkerManager>>,
    Json(request): Json<ConfigureRequest>,
) -> Result<Json<ConfigureResponse>, HttpResponseError> {
    manager.configure(request).await?;
    Ok(Json(ConfigureResponse::default()))
}

async fn health() -> &'static str {
    "ok"
}
