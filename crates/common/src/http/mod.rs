use std::{
    fmt,
    net::SocketAddr,
};

use anyhow::Context as _;
use axum::{
    response::{
        IntoResponse,
        Response,
    },
    Router,
};
use errors::{
    ErrorEnvelope,
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use http::header::HeaderValue;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
};

pub mod extract;

#[allow(clippy::declare_interior_mutable_const)]
pub const APPLICATION_JSON_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/json");
#[allow(clippy::declare_interior_mutable_const)]
pub const APPLICATION_ZIP_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/zip");

/// `HttpResponseError` is the rejection type used by every handler in the
/// kit. Errors tagged with [`ErrorMetadata`] map to their status code and a
/// JSON error envelope; untagged errors become opaque 500s. Server-side
/// faults are logged with their full chain at response time.
pub struct HttpResponseError(anyhow::Error);

impl HttpResponseError {
    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<ErrorMetadata> for HttpResponseError {
    fn from(em: ErrorMetadata) -> Self {
        Self(em.into())
    }
}

impl fmt::Debug for HttpResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpResponseError({:?})", self.0)
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        errors::report_error(&self.0);
        let status = self.0.http_status();
        let envelope = ErrorEnvelope {
            code: self.0.short_msg().to_string(),
            message: self.0.user_facing_message(),
        };
        (status, axum::Json(envelope)).into_response()
    }
}

/// An owned, running HTTP server. Binding returns once the listener is
/// live, so `local_addr` can be published to peers immediately; `shutdown`
/// stops accepting, drains in-flight requests, and joins the serve task.
pub struct HttpServer {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl HttpServer {
    pub async fn bind(name: &'static str, router: Router, addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("couldn't bind {name} listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("{name} listening on {local_addr}");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!("{name} server failed: {e:#}");
            }
        });
        Ok(Self {
            name,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful shutdown. Callers must first unblock any long-polling
    /// handlers (e.g. by draining the queues they wait on) or this will
    /// stall until those connections close.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                tracing::error!("{} server task panicked: {e}", self.name);
            }
        }
    }
}
