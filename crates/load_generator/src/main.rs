use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use load_generator::{
    run_scan,
    staircase,
    ScanConfig,
};

#[derive(Parser, Debug)]
struct Config {
    /// Base URL of the function service
    #[clap(long, default_value = "http://127.0.0.1:7060")]
    api: String,
    /// Function to drive
    #[clap(long)]
    function: String,
    /// Concurrency of the first step
    #[clap(long, default_value = "2")]
    begin_concurrency: usize,
    /// Concurrency added per step
    #[clap(long, default_value = "2")]
    delta_concurrency: usize,
    /// Number of staircase steps
    #[clap(long, default_value = "5")]
    num_steps: usize,
    /// Seconds per step
    #[clap(long, default_value = "3")]
    step_duration: u64,
    /// Host interface the sink binds to
    #[clap(short, long, default_value = "0.0.0.0")]
    interface: std::net::Ipv4Addr,
    /// Sink port functions report back to
    #[clap(short, long, default_value = "3000")]
    port: u16,
    /// URL functions use to reach the sink; defaults to the bound address
    #[clap(long)]
    tracking_url: Option<String>,
    /// JSON object merged into every invocation's arguments
    #[clap(long, value_parser = parse_args)]
    args: Option<serde_json::Map<String, serde_json::Value>>,
    /// Where raw sink events are appended
    #[clap(long, default_value = "scan-results.log")]
    logfile: PathBuf,
    /// Seconds to wait for stragglers after the last span change
    #[clap(long, default_value = "60")]
    max_wait: u64,
}

fn parse_args(s: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match serde_json::from_str(s) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cmd_util::env::config_service();
    let config = Config::parse();

    let spans = staircase(
        config.begin_concurrency,
        config.delta_concurrency,
        config.num_steps,
        Duration::from_secs(config.step_duration),
    );
    let report = run_scan(ScanConfig {
        api_base: config.api,
        function: config.function,
        args: config.args.unwrap_or_default(),
        spans,
        sink_addr: SocketAddr::from((config.interface, config.port)),
        tracking_url: config.tracking_url,
        results_log: config.logfile,
        max_wait: Some(Duration::from_secs(config.max_wait)),
    })
    .await?;

    tracing::info!(
        "scan {} finished: {:?} (all done: {})",
        report.scan_id,
        report.counts,
        report.all_done,
    );
    if !report.all_done {
        anyhow::bail!("scan left invocations unaccounted for");
    }
    Ok(())
}
