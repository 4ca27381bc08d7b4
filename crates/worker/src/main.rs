use std::{
    net::SocketAddr,
    path::PathBuf,
};

use clap::Parser;
use worker::{
    WorkerConfig,
    WorkerManager,
    WorkerService,
};

#[derive(Parser, Debug)]
struct Config {
    /// Host interface to bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    interface: std::net::Ipv4Addr,
    /// Port the configure RPC server should use (0 picks a free port)
    #[clap(short, long, default_value = "7061")]
    port: u16,
    /// Directory for extracted code archives
    #[clap(long, default_value = "/tmp/srk/worker")]
    scratch_dir: PathBuf,
    /// Region name handed to container instances
    #[clap(long, default_value = "us-west-2", env = "AWS_REGION")]
    region: String,
    /// Run every instance from this image instead of deriving one from the
    /// function's runtime tag
    #[clap(long)]
    image: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cmd_util::env::config_service();
    let config = Config::parse();

    let manager = WorkerManager::new(WorkerConfig {
        scratch_dir: config.scratch_dir,
        region: config.region,
        image_override: config.image,
    });
    let addr = SocketAddr::from((config.interface, config.port));
    let service = WorkerService::start(manager, addr).await?;
    tracing::info!("worker ready at {}", service.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    service.shutdown().await;
    Ok(())
}
