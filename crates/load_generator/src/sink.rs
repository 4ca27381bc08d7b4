//! The sink the invoked functions report back to: begin/end lifecycle
//! events and their result data. The sink owns scan termination - once
//! every launched invocation has completed and reported data, it flips the
//! done flag the driver waits on.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{
        get,
        post,
    },
    Router,
};
use bytes::Bytes;
use common::http::HttpResponseError;
use errors::ErrorMetadata;
use serde::Deserialize;
use serde_json::{
    Map,
    Value,
};
use tokio::sync::{
    mpsc,
    watch,
};

use crate::{
    control::CompletionMessage,
    progress::Progress,
};

#[derive(Clone)]
pub struct SinkState {
    pub progress: Arc<Progress>,
    pub completion_tx: mpsc::UnboundedSender<CompletionMessage>,
    pub log_tx: mpsc::UnboundedSender<String>,
    pub done_tx: watch::Sender<bool>,
}

#[derive(Deserialize, Debug)]
struct LifecycleEvent {
    action: String,
    uuid: String,
    // Anything else the function reported rides along to the results log
    // via the raw body; keep it so deserialization doesn't reject it.
    #[serde(flatten)]
    _extra: Map<String, Value>,
}

#[derive(Deserialize, Debug)]
struct DataEvent {
    uuid: String,
    #[serde(flatten)]
    _extra: Map<String, Value>,
}

pub fn sink_router(state: SinkState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/event", post(handle_event))
        .route("/data", post(handle_data))
        .with_state(state)
}

async fn index() -> &'static str {
    "Serverless Experiment Controller"
}

async fn handle_event(
    State(state): State<SinkState>,
    body: Bytes,
) -> Result<&'static str, HttpResponseError> {
    let event: LifecycleEvent = parse(&body)?;
    log_raw(&state, &body);
    match event.action.as_str() {
        "begin" => state.progress.set_running(&event.uuid),
        "end" => {
            state.progress.set_done(&event.uuid);
            let _ = state.completion_tx.send(CompletionMessage {
                uuid: event.uuid,
            });
            check_all_done(&state);
        },
        other => {
            return Err(ErrorMetadata::bad_request(
                "UnknownAction",
                format!("Unknown lifecycle action {other}"),
            )
            .into());
        },
    }
    Ok("Thanks for the event.")
}

async fn handle_data(
    State(state): State<SinkState>,
    body: Bytes,
) -> Result<&'static str, HttpResponseError> {
    let event: DataEvent = parse(&body)?;
    log_raw(&state, &body);
    state.progress.set_data(&event.uuid);
    check_all_done(&state);
    Ok("Thanks for the data.")
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, HttpResponseError> {
    serde_json::from_slice(body).map_err(|e| {
        HttpResponseError::from(anyhow::anyhow!(ErrorMetadata::bad_request(
            "InvalidEventBody",
            format!("Couldn't parse event body: {e}"),
        )))
    })
}

fn log_raw(state: &SinkState, body: &[u8]) {
    let line = String::from_utf8_lossy(body).into_owned();
    let _ = state.log_tx.send(line);
}

fn check_all_done(state: &SinkState) {
    if state.progress.all_done() {
        tracing::info!(
            "finished processing responses for scan {}",
            state.progress.scan_id()
        );
        let _ = state.done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use common::http::HttpServer;
    use serde_json::json;

    use super::*;

    struct SinkFixture {
        progress: Arc<Progress>,
        completion_rx: mpsc::UnboundedReceiver<CompletionMessage>,
        log_rx: mpsc::UnboundedReceiver<String>,
        done_rx: watch::Receiver<bool>,
        server: HttpServer,
        base: String,
    }

    async fn sink_fixture() -> anyhow::Result<SinkFixture> {
        let progress = Progress::new("abc123".to_string());
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let state = SinkState {
            progress: progress.clone(),
            completion_tx,
            log_tx,
            done_tx,
        };
        let server =
            HttpServer::bind("scan-sink", sink_router(state), "127.0.0.1:0".parse()?).await?;
        let base = format!("http://{}", server.local_addr());
        Ok(SinkFixture {
            progress,
            completion_rx,
            log_rx,
            done_rx,
            server,
            base,
        })
    }

    #[tokio::test]
    async fn test_event_flow_drives_progress_and_done() -> anyhow::Result<()> {
        let mut fx = sink_fixture().await?;
        let uuid = fx.progress.next_uuid();
        fx.progress.set_invoked(&uuid);
        fx.progress.set_invocation_done();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/event", fx.base))
            .json(&json!({"action": "begin", "uuid": uuid, "worker": "w1"}))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(fx.progress.counts().running, 1);

        let response = client
            .post(format!("{}/event", fx.base))
            .json(&json!({"action": "end", "uuid": uuid}))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 200);
        let completion = fx.completion_rx.recv().await.expect("completion message");
        assert_eq!(completion.uuid, uuid);
        assert!(!*fx.done_rx.borrow());

        let response = client
            .post(format!("{}/data", fx.base))
            .json(&json!({"uuid": uuid, "data": {"latency_ms": 12}}))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 200);
        fx.done_rx.wait_for(|done| *done).await?;

        // Raw bodies were forwarded to the results log verbatim.
        let first = fx.log_rx.recv().await.expect("log line");
        assert!(first.contains("\"worker\":\"w1\""));

        fx.server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events_rejected() -> anyhow::Result<()> {
        let fx = sink_fixture().await?;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/event", fx.base))
            .body("not json")
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 400);

        let response = client
            .post(format!("{}/event", fx.base))
            .json(&json!({"action": "pause", "uuid": "abc123:1"}))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 400);

        fx.server.shutdown().await;
        Ok(())
    }
}
