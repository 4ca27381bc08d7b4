//! Closed-loop concurrency-scan load driver: launches and replenishes
//! fire-and-forget invocations so the number in flight tracks a staircase
//! target, while a sink server collects the functions' own lifecycle
//! reports.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use common::http::HttpServer;
use serde_json::{
    Map,
    Value,
};
use tokio::{
    io::AsyncWriteExt as _,
    sync::{
        mpsc,
        watch,
    },
};

pub mod control;
pub mod invoker;
mod metrics;
pub mod progress;
pub mod sink;
pub mod spans;

pub use control::{
    CompletionMessage,
    ConcurrencyControl,
};
pub use invoker::{
    HttpInvoker,
    Invoker,
};
pub use progress::{
    Progress,
    ProgressCounts,
};
pub use sink::{
    sink_router,
    SinkState,
};
pub use spans::{
    staircase,
    ScanSpan,
};

#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Base URL of the function service, e.g. `http://127.0.0.1:7060`.
    pub api_base: String,
    pub function: String,
    /// Argument template merged into every invocation body.
    pub args: Map<String, Value>,
    pub spans: Vec<ScanSpan>,
    pub sink_addr: SocketAddr,
    /// URL functions use to reach the sink; derived from the bound sink
    /// address when not set.
    pub tracking_url: Option<String>,
    /// Raw sink events are appended here, one JSON body per line.
    pub results_log: PathBuf,
    /// Give up waiting for stragglers this long after the last span
    /// change. None waits forever.
    pub max_wait: Option<Duration>,
}

#[derive(Debug)]
pub struct ScanReport {
    pub scan_id: String,
    pub counts: ProgressCounts,
    pub all_done: bool,
}

pub fn gen_scan_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Run one scan to completion: start the sink, walk the span timeline,
/// then wait for every launched invocation to finish and report data.
pub async fn run_scan(config: ScanConfig) -> anyhow::Result<ScanReport> {
    let scan_id = gen_scan_id();
    tracing::info!("starting scan {scan_id}");
    let progress = Progress::new(scan_id.clone());

    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = watch::channel(false);
    let log_writer = tokio::spawn(write_results_log(config.results_log.clone(), log_rx));

    let sink_state = SinkState {
        progress: progress.clone(),
        completion_tx,
        log_tx,
        done_tx,
    };
    let sink = HttpServer::bind("scan-sink", sink_router(sink_state), config.sink_addr).await?;
    let tracking_url = config
        .tracking_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", sink.local_addr()));

    let invoker = HttpInvoker::new(
        &config.api_base,
        &config.function,
        scan_id.clone(),
        tracking_url,
        config.args.clone(),
    )?;
    ConcurrencyControl::new(config.spans.clone(), invoker, completion_rx, progress.clone())
        .run()
        .await?;

    // Every span change has fired; the sink finishes the scan.
    if !progress.all_done() {
        match config.max_wait {
            Some(limit) => {
                tokio::select! {
                    _ = done_rx.wait_for(|done| *done) => {},
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(
                            "gave up waiting for stragglers after {limit:?}: {:?}",
                            progress.counts(),
                        );
                    },
                }
            },
            None => {
                let _ = done_rx.wait_for(|done| *done).await;
            },
        }
    }

    sink.shutdown().await;
    log_writer
        .await
        .context("results log writer panicked")?
        .context("writing results log")?;
    tracing::info!("scan data saved to {}", config.results_log.display());

    let counts = progress.counts();
    Ok(ScanReport {
        scan_id,
        counts,
        all_done: progress.all_done(),
    })
}

async fn write_results_log(
    path: PathBuf,
    mut log_rx: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("couldn't open results log {}", path.display()))?;
    while let Some(line) = log_rx.recv().await {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    Ok(())
}
