use std::sync::Arc;

use axum::{
    response::{
        IntoResponse,
        Response,
    },
    routing::{
        delete,
        get,
        post,
    },
    Router,
};
use common::http::HttpResponseError;
use http::{
    header::CONTENT_TYPE,
    HeaderMap,
};

use crate::{
    functions::{
        create_function,
        delete_function,
        list_functions,
    },
    invoke::{
        fallback,
        invoke_function,
        preflight_response,
    },
    ApiService,
};

pub fn router(st: Arc<ApiService>) -> Router {
    Router::new()
        .route(
            "/functions",
            post(create_function).get(list_functions).options(preflight),
        )
        .route(
            "/functions/{name}",
            delete(delete_function).options(preflight),
        )
        .route(
            "/functions/{name}/invocations",
            post(invoke_function).options(preflight),
        )
        // The AWS-shaped alias the SDKs use.
        .route(
            "/2015-03-31/functions/{name}/invocations",
            post(invoke_function).options(preflight),
        )
        .route("/metrics", get(serve_metrics))
        .route("/", get(root).options(preflight))
        .fallback(fallback)
        .with_state(st.clone())
        .merge(code_store::code_router(st.code_store.clone()))
}

async fn preflight(headers: HeaderMap) -> Response {
    preflight_response(&headers)
}

async fn root() -> &'static str {
    "Serverless Research Kit function service"
}

async fn serve_metrics() -> Result<impl IntoResponse, HttpResponseError> {
    let text = metrics::export_text()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], text))
}
