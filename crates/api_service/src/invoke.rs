//! The invocation handler: parses the invocation headers, routes the three
//! invocation types, and renders the Amazon-shaped response surface.

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::State,
    response::{
        IntoResponse,
        Response,
    },
};
use bytes::Bytes;
use common::{
    http::{
        extract::Path,
        HttpResponseError,
        APPLICATION_JSON_CONTENT_TYPE,
    },
    types::new_trace_id,
    RequestId,
};
use errors::ErrorMetadata;
use http::{
    header::{
        HeaderMap,
        CONTENT_TYPE,
        ORIGIN,
    },
    Method,
    StatusCode,
};
use runtime_broker::{
    InvocationType,
    InvokeOutcome,
    InvokeReply,
    LogType,
    RequestContext,
};
use serde::Serialize;

use crate::{
    metrics,
    ApiService,
};

const INVOCATION_TYPE_HEADER: &str = "X-Amz-Invocation-Type";
const CLIENT_CONTEXT_HEADER: &str = "X-Amz-Client-Context";
const LOG_TYPE_HEADER: &str = "X-Amz-Log-Type";
const REQUEST_ID_HEADER: &str = "x-amzn-RequestId";
const REMAPPED_CONTENT_LENGTH_HEADER: &str = "x-amzn-Remapped-Content-Length";
const EXECUTED_VERSION_HEADER: &str = "X-Amz-Executed-Version";
const TRACE_ID_HEADER: &str = "X-Amzn-Trace-Id";
const FUNCTION_ERROR_HEADER: &str = "X-Amz-Function-Error";
const LOG_RESULT_HEADER: &str = "X-Amz-Log-Result";

/// Response headers invocations may expose to browsers.
const EXPOSED_HEADERS: &str = "x-amzn-RequestId,x-amzn-ErrorType,x-amzn-ErrorMessage,Date,x-amz-log-result,x-amz-function-error";
const PREFLIGHT_MAX_AGE: &str = "172800";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutBody {
    error_type: &'static str,
    error_message: String,
}

pub async fn invoke_function(
    State(st): State<Arc<ApiService>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpResponseError> {
    if st.is_shutting_down() {
        return Err(ErrorMetadata::shutdown(
            "Shutdown",
            "The service is draining and refusing new invocations",
        )
        .into());
    }

    let invocation_type = match header_str(&headers, INVOCATION_TYPE_HEADER)? {
        Some(s) => InvocationType::parse(s)?,
        None => InvocationType::default(),
    };
    let log_type = match header_str(&headers, LOG_TYPE_HEADER)? {
        Some(s) => LogType::parse(s)?,
        None => LogType::default(),
    };
    let client_context = match header_str(&headers, CLIENT_CONTEXT_HEADER)? {
        Some(encoded) => Some(decode_client_context(encoded)?),
        None => None,
    };
    let cross_origin = headers.contains_key(ORIGIN);

    let entry = st.lookup(&name)?;
    metrics::log_invocation(invocation_type);

    if invocation_type == InvocationType::DryRun {
        let builder = common_headers(
            http::Response::builder().status(StatusCode::NO_CONTENT),
            &RequestId::new(),
            cross_origin,
        );
        return Ok(builder.body(Body::empty()).context("building response")?);
    }

    let ctx = RequestContext::new(
        body,
        invocation_type,
        client_context,
        log_type,
        st.function_arn(&name),
        new_trace_id(),
        entry.record.timeout() + st.config().invoke_slack,
    );
    let request_id = ctx.request_id.clone();
    let trace_id = ctx.trace_id.clone();
    let handle = entry.broker.enqueue(ctx)?;

    if invocation_type == InvocationType::Event {
        // Completion happens in the background; the caller just gets the id.
        let broker = entry.broker.clone();
        tokio::spawn(async move {
            match broker.await_reply(handle).await {
                InvokeOutcome::Completed(_) => {},
                InvokeOutcome::TimedOut => {
                    tracing::warn!("event invocation {} timed out", broker.function_name());
                },
                InvokeOutcome::Failed(em) => errors::report_error(&em.into()),
            }
        });
        let builder = common_headers(
            http::Response::builder().status(StatusCode::ACCEPTED),
            &request_id,
            cross_origin,
        )
        .header(TRACE_ID_HEADER, &trace_id);
        return Ok(builder.body(Body::empty()).context("building response")?);
    }

    let timer = metrics::sync_invoke_timer();
    let outcome = entry.broker.await_reply(handle).await;
    timer.finish();

    let mut builder = common_headers(http::Response::builder(), &request_id, cross_origin)
        .header(EXECUTED_VERSION_HEADER, &entry.record.version)
        .header(TRACE_ID_HEADER, &trace_id);
    let response = match outcome {
        InvokeOutcome::Completed(InvokeReply::Payload { bytes, log_tail }) => {
            if log_type.is_tail() {
                if let Some(tail) = log_tail {
                    builder = builder.header(LOG_RESULT_HEADER, tail);
                }
            }
            builder
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, APPLICATION_JSON_CONTENT_TYPE)
                .body(Body::from(bytes))
        },
        InvokeOutcome::Completed(InvokeReply::FunctionError { error, log_tail }) => {
            if log_type.is_tail() {
                if let Some(tail) = log_tail {
                    builder = builder.header(LOG_RESULT_HEADER, tail);
                }
            }
            let payload = serde_json::to_vec(&error).context("serializing function error")?;
            builder
                .status(StatusCode::OK)
                .header(FUNCTION_ERROR_HEADER, error.kind.as_str())
                .header(CONTENT_TYPE, APPLICATION_JSON_CONTENT_TYPE)
                .body(Body::from(payload))
        },
        InvokeOutcome::TimedOut => {
            if log_type.is_tail() {
                builder = builder.header(LOG_RESULT_HEADER, base64::encode("(timeout)"));
            }
            let payload = serde_json::to_vec(&TimeoutBody {
                error_type: "Function.Timeout",
                error_message: format!(
                    "Function {name} timed out after {} seconds",
                    entry.record.timeout_secs
                ),
            })
            .context("serializing timeout body")?;
            builder
                .status(StatusCode::GATEWAY_TIMEOUT)
                .header(FUNCTION_ERROR_HEADER, "Unhandled")
                .header(CONTENT_TYPE, APPLICATION_JSON_CONTENT_TYPE)
                .body(Body::from(payload))
        },
        InvokeOutcome::Failed(em) => return Err(em.into()),
    };
    Ok(response.context("building response")?)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> anyhow::Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|_| {
                ErrorMetadata::bad_request(
                    "InvalidHeader",
                    format!("{name} contains non-ASCII bytes"),
                )
                .into()
            })
        })
        .transpose()
}

fn decode_client_context(encoded: &str) -> anyhow::Result<String> {
    let decoded = base64::decode(encoded).map_err(|e| {
        ErrorMetadata::bad_request(
            "ClientContextDecodingError",
            format!("Couldn't decode {CLIENT_CONTEXT_HEADER}: {e}"),
        )
    })?;
    String::from_utf8(decoded).map_err(|_| {
        ErrorMetadata::bad_request(
            "ClientContextDecodingError",
            format!("{CLIENT_CONTEXT_HEADER} is not UTF-8"),
        )
        .into()
    })
}

fn common_headers(
    builder: http::response::Builder,
    request_id: &RequestId,
    cross_origin: bool,
) -> http::response::Builder {
    let mut builder = builder
        .header(REQUEST_ID_HEADER, request_id.as_str())
        .header(REMAPPED_CONTENT_LENGTH_HEADER, "0");
    if cross_origin {
        builder = builder
            .header("access-control-allow-origin", "*")
            .header("access-control-expose-headers", EXPOSED_HEADERS);
    }
    builder
}

/// Answer a preflight. Requests without an Origin get a bare 403; the rest
/// get the permissive policy with the full exposed-header list.
pub fn preflight_response(headers: &HeaderMap) -> Response {
    if !headers.contains_key(ORIGIN) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let mut builder = http::Response::builder()
        .status(StatusCode::OK)
        .header(REQUEST_ID_HEADER, RequestId::new().as_str())
        .header("access-control-allow-origin", "*")
        .header("access-control-expose-headers", EXPOSED_HEADERS)
        .header("access-control-max-age", PREFLIGHT_MAX_AGE);
    if let Some(requested) = headers.get("access-control-request-headers") {
        builder = builder.header("access-control-allow-headers", requested);
    }
    if let Some(requested) = headers.get("access-control-request-method") {
        builder = builder.header("access-control-allow-methods", requested);
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::OK.into_response())
}

/// Catch-all: preflights succeed anywhere, everything else is a 404
/// envelope.
pub async fn fallback(method: Method, headers: HeaderMap) -> Response {
    if method == Method::OPTIONS {
        return preflight_response(&headers);
    }
    HttpResponseError::from(ErrorMetadata::not_found(
        "NotFound",
        "No such route",
    ))
    .into_response()
}
