use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use api_service::{
    ApiConfig,
    ApiServer,
};
use clap::Parser;

#[derive(Parser, Debug)]
struct Config {
    /// Host interface to bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    interface: std::net::Ipv4Addr,
    /// Port the function-control API should use (0 picks a free port)
    #[clap(short, long, default_value = "7060")]
    port: u16,
    /// Configure-RPC address of a remote worker; repeat for each worker.
    /// With none given, a worker manager runs in-process.
    #[clap(long = "worker")]
    workers: Vec<String>,
    /// Host remote workers use to reach this process
    #[clap(long, default_value = "127.0.0.1")]
    advertise_host: String,
    /// Host container instances use to reach their runtime endpoint
    #[clap(long, default_value = "host.docker.internal")]
    runtime_host: String,
    /// Scratch directory for the in-process worker manager
    #[clap(long, default_value = "/tmp/srk/api-worker")]
    scratch_dir: PathBuf,
    #[clap(long, default_value = "us-west-2", env = "AWS_REGION")]
    region: String,
    /// Run every instance from this image instead of deriving one from the
    /// function's runtime tag
    #[clap(long)]
    image: Option<String>,
    /// Per-function work queue capacity
    #[clap(long, default_value = "20")]
    queue_capacity: usize,
    /// Instance copies started per installed function
    #[clap(long, default_value = "1")]
    instances_per_function: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cmd_util::env::config_service();
    let config = Config::parse();

    let server = ApiServer::start(ApiConfig {
        listen_addr: SocketAddr::from((config.interface, config.port)),
        worker_addrs: config.workers,
        advertise_host: config.advertise_host,
        runtime_host: config.runtime_host,
        runtime_interface: std::net::Ipv4Addr::UNSPECIFIED,
        scratch_dir: config.scratch_dir,
        region: config.region,
        image_override: config.image,
        queue_capacity: config.queue_capacity,
        instances_per_function: config.instances_per_function,
        invoke_slack: Duration::from_secs(1),
    })
    .await?;
    tracing::info!("function service ready at {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
