//! The container-facing runtime HTTP surface, one server per function.
//! Instances long-poll `next`, then post exactly one response or error per
//! request id.

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::State,
    response::{
        IntoResponse,
        Response,
    },
    routing::{
        get,
        post,
    },
    Router,
};
use bytes::Bytes;
use common::{
    http::{
        extract::{
            Json,
            Path,
        },
        HttpResponseError,
        HttpServer,
        APPLICATION_JSON_CONTENT_TYPE,
    },
    RequestId,
};
use errors::ErrorMetadata;
use http::{
    header::CONTENT_TYPE,
    HeaderMap,
    StatusCode,
};
use serde::Serialize;

use crate::{
    context::{
        FunctionError,
        FunctionErrorKind,
    },
    RuntimeBroker,
};

const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
const DEADLINE_MS_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
const INVOKED_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
const CLIENT_CONTEXT_HEADER: &str = "Lambda-Runtime-Client-Context";
const COGNITO_IDENTITY_HEADER: &str = "Lambda-Runtime-Cognito-Identity";
const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";
const LOG_TYPE_HEADER: &str = "Docker-Lambda-Log-Type";
const LOG_RESULT_HEADER: &str = "Docker-Lambda-Log-Result";

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

fn accepted() -> impl IntoResponse {
    (StatusCode::ACCEPTED, axum::Json(StatusResponse { status: "OK" }))
}

/// A broker plus its running listener. The listen address is what gets
/// published to every instance serving the function.
pub struct RuntimeEndpoint {
    broker: Arc<RuntimeBroker>,
    server: HttpServer,
}

impl RuntimeEndpoint {
    pub async fn start(broker: Arc<RuntimeBroker>, addr: SocketAddr) -> anyhow::Result<Self> {
        let server = HttpServer::bind("runtime-endpoint", runtime_router(broker.clone()), addr)
            .await
            .with_context(|| format!("starting runtime endpoint for {}", broker.function_name()))?;
        Ok(Self { broker, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn broker(&self) -> &Arc<RuntimeBroker> {
        &self.broker
    }

    /// Fail outstanding work with `error`, then stop the listener. The
    /// broker drains first so parked long-polls resolve and the graceful
    /// shutdown doesn't stall on them.
    pub async fn shutdown(self, error: ErrorMetadata) {
        self.broker.shutdown(error);
        self.server.shutdown().await;
    }
}

pub fn runtime_router(broker: Arc<RuntimeBroker>) -> Router {
    Router::new()
        .route("/2018-06-01/ping", get(ping))
        .route("/2018-06-01/runtime/invocation/next", get(next_invocation))
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/response",
            post(post_response),
        )
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/error",
            post(post_error),
        )
        .route("/2018-06-01/runtime/init/error", post(post_init_error))
        .with_state(broker)
}

async fn ping() -> &'static str {
    "pong"
}

async fn next_invocation(
    State(broker): State<Arc<RuntimeBroker>>,
) -> Result<Response, HttpResponseError> {
    let ctx = broker.next_invocation().await?;
    let mut builder = http::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, APPLICATION_JSON_CONTENT_TYPE)
        .header(REQUEST_ID_HEADER, ctx.request_id.as_str())
        .header(DEADLINE_MS_HEADER, ctx.deadline_unix_ms()?.to_string())
        .header(INVOKED_ARN_HEADER, &ctx.invoked_arn)
        .header(TRACE_ID_HEADER, &ctx.trace_id);
    if let Some(client_context) = &ctx.client_context {
        builder = builder.header(CLIENT_CONTEXT_HEADER, client_context);
    }
    if let Some(cognito_identity) = &ctx.cognito_identity {
        builder = builder.header(COGNITO_IDENTITY_HEADER, cognito_identity);
    }
    if ctx.log_type.is_tail() {
        builder = builder.header(LOG_TYPE_HEADER, "Tail");
    }
    let response = builder
        .body(Body::from(ctx.payload.clone()))
        .context("building next-invocation response")?;
    Ok(response)
}

async fn post_response(
    State(broker): State<Arc<RuntimeBroker>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpResponseError> {
    let request_id = RequestId::from(request_id);
    broker.post_response(&request_id, body, log_tail(&headers))?;
    Ok(accepted())
}

async fn post_error(
    State(broker): State<Arc<RuntimeBroker>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    Json(mut error): Json<FunctionError>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let request_id = RequestId::from(request_id);
    if let Some(kind) = headers.get(ERROR_TYPE_HEADER).and_then(|v| v.to_str().ok()) {
        error.kind = FunctionErrorKind::parse(kind);
    }
    broker.post_error(&request_id, error, log_tail(&headers))?;
    Ok(accepted())
}

async fn post_init_error(
    State(broker): State<Arc<RuntimeBroker>>,
    Json(error): Json<FunctionError>,
) -> Result<impl IntoResponse, HttpResponseError> {
    broker.record_init_error(error);
    Ok(accepted())
}

fn log_tail(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOG_RESULT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        context::{
            InvocationType,
            LogType,
            RequestContext,
        },
        InvokeOutcome,
        InvokeReply,
        DEFAULT_QUEUE_CAPACITY,
    };

    async fn started_endpoint() -> anyhow::Result<(RuntimeEndpoint, String)> {
        let broker = RuntimeBroker::new("echo".to_string(), DEFAULT_QUEUE_CAPACITY);
        let endpoint = RuntimeEndpoint::start(broker, "127.0.0.1:0".parse()?).await?;
        let base = format!("http://{}/2018-06-01", endpoint.local_addr());
        Ok((endpoint, base))
    }

    fn sync_ctx(payload: &'static [u8]) -> RequestContext {
        RequestContext::new(
            Bytes::from_static(payload),
            InvocationType::RequestResponse,
            Some("eyJjbGllbnQiOnt9fQ==".to_string()),
            LogType::None,
            "arn:aws:lambda:us-west-2:000000000000:function:echo".to_string(),
            common::types::new_trace_id(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_ping() -> anyhow::Result<()> {
        let (endpoint, base) = started_endpoint().await?;
        let body = reqwest::get(format!("{base}/ping")).await?.text().await?;
        assert_eq!(body, "pong");
        endpoint
            .shutdown(ErrorMetadata::shutdown("Shutdown", "test over"))
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_then_respond_over_http() -> anyhow::Result<()> {
        let (endpoint, base) = started_endpoint().await?;
        let broker = endpoint.broker().clone();
        let handle = broker.enqueue(sync_ctx(b"{\"message\":\"hello lambda!\"}"))?;

        let next = reqwest::get(format!("{base}/runtime/invocation/next")).await?;
        assert_eq!(next.status().as_u16(), 200);
        let request_id = next.headers()[REQUEST_ID_HEADER].to_str()?.to_string();
        assert_eq!(request_id, handle.request_id.to_string());
        assert!(next.headers().contains_key(DEADLINE_MS_HEADER));
        assert!(next.headers().contains_key(TRACE_ID_HEADER));
        assert_eq!(
            next.headers()[CLIENT_CONTEXT_HEADER].to_str()?,
            "eyJjbGllbnQiOnt9fQ=="
        );
        let event = next.bytes().await?;
        assert_eq!(event.as_ref(), b"{\"message\":\"hello lambda!\"}".as_slice());

        let client = reqwest::Client::new();
        let ack = client
            .post(format!("{base}/runtime/invocation/{request_id}/response"))
            .body(event.to_vec())
            .send()
            .await?;
        assert_eq!(ack.status().as_u16(), 202);
        let ack_body: serde_json::Value = ack.json().await?;
        assert_eq!(ack_body["status"], "OK");

        match broker.await_reply(handle).await {
            InvokeOutcome::Completed(InvokeReply::Payload { bytes, .. }) => {
                assert_eq!(bytes.as_ref(), b"{\"message\":\"hello lambda!\"}".as_slice());
            },
            other => panic!("unexpected outcome: {other:?}"),
        }

        endpoint
            .shutdown(ErrorMetadata::shutdown("Shutdown", "test over"))
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn test_error_post_over_http() -> anyhow::Result<()> {
        let (endpoint, base) = started_endpoint().await?;
        let broker = endpoint.broker().clone();
        let handle = broker.enqueue(sync_ctx(b"{}"))?;
        broker.next_invocation().await?;
        let request_id = handle.request_id.to_string();

        let client = reqwest::Client::new();
        let ack = client
            .post(format!("{base}/runtime/invocation/{request_id}/error"))
            .header(ERROR_TYPE_HEADER, "Handled")
            .json(&serde_json::json!({
                "errorType": "ValueError",
                "errorMessage": "bad input",
                "stackTrace": ["line 1"],
            }))
            .send()
            .await?;
        assert_eq!(ack.status().as_u16(), 202);

        match broker.await_reply(handle).await {
            InvokeOutcome::Completed(InvokeReply::FunctionError { error, .. }) => {
                assert_eq!(error.error_type.as_deref(), Some("ValueError"));
                assert_eq!(error.kind, FunctionErrorKind::Handled);
            },
            other => panic!("unexpected outcome: {other:?}"),
        }

        endpoint
            .shutdown(ErrorMetadata::shutdown("Shutdown", "test over"))
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_request_id_post() -> anyhow::Result<()> {
        let (endpoint, base) = started_endpoint().await?;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/runtime/invocation/nonsense/response"))
            .body("{}")
            .send()
            .await?;
        assert_eq!(resp.status().as_u16(), 500);
        let body: serde_json::Value = resp.json().await?;
        assert_eq!(body["code"], "InvalidRequestId");

        endpoint
            .shutdown(ErrorMetadata::shutdown("Shutdown", "test over"))
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn test_init_error_is_recorded() -> anyhow::Result<()> {
        let (endpoint, base) = started_endpoint().await?;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/runtime/init/error"))
            .json(&serde_json::json!({
                "errorType": "Runtime.NoBootstrap",
                "errorMessage": "bootstrap not found",
            }))
            .send()
            .await?;
        assert_eq!(resp.status().as_u16(), 202);
        let recorded = endpoint.broker().init_error().expect("init error recorded");
        assert_eq!(recorded.error_message, "bootstrap not found");

        endpoint
            .shutdown(ErrorMetadata::shutdown("Shutdown", "test over"))
            .await;
        Ok(())
    }
}
