//! CPN Controller - Main entry point

use anyhow::Context;
use clap::Parser;
use cpn_controller::{event_stream, Controller, FabricBridge};
use cpn_core::ControllerConfig;
use cpn_types::{ChannelSouthbound, PathMetric};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpn-controller", about = "Anycast SDN controller for computing power networks")]
struct Cli {
    /// JSON configuration file; environment overrides still apply
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path metric (hop, delay, bw)
    #[arg(long)]
    weight: Option<PathMetric>,

    /// Candidate paths kept per switch pair
    #[arg(long)]
    k_paths: Option<usize>,

    /// Fabric bridge listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ControllerConfig::from_env(),
    };
    if let Some(metric) = cli.weight {
        config.topology.metric = metric;
    }
    if let Some(k) = cli.k_paths {
        config.topology.k_paths = k;
    }
    if let Some(addr) = cli.listen {
        config.network.listen_addr = addr.ip().to_string();
        config.network.port = addr.port();
    }

    // Southbound channel drained by the bridge
    let (southbound, outbound) = ChannelSouthbound::new();
    let controller = Arc::new(Controller::new(config.clone(), Arc::new(southbound)).context("building controller")?);

    let bridge = FabricBridge::bind(&config.listen_socket())
        .await
        .context("binding fabric bridge")?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let bridge_task = tokio::spawn(bridge.serve(event_tx, outbound));

    info!(controller_id = %controller.controller_id(), "Controller started");
    tokio::select! {
        _ = controller.clone().run(event_stream(event_rx)) => warn!("Event stream ended"),
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    bridge_task.abort();
    Ok(())
}
