use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tapmesh::config::{Args, FileConfig, NodeConfig};
use tapmesh::dht::DhtClient;
use tapmesh::engine::OverlayEngine;
use tapmesh::inventory;
use tapmesh::tap::TapDevice;
use tapmesh::transport::UdpTransport;
use tapmesh::Result;

/// Configuration file read from the working directory.
const CONFIG_FILE: &str = "config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let file = FileConfig::load(CONFIG_FILE)?;
    let config = NodeConfig::from_args(args, file)?;
    info!(
        "mask {} accepted; the interface will be configured /24",
        config.mask
    );
    if let Some(direct) = &config.direct {
        info!("direct peering target {} recorded but not yet implemented", direct);
    }

    let local_ips = inventory::collect();

    let tap = TapDevice::open(&config.device)?;
    tap.configure(&config.iptool, config.ip, config.mac).await?;

    let transport = Arc::new(UdpTransport::bind(config.port).await?);
    info!("started UDP listener at port {}", transport.local_port());

    let mut dht_config = DhtClient::config();
    dht_config.network_hash = config.network_hash.clone();
    dht_config.p2p_port = transport.local_port();
    let dht = DhtClient::initialize(dht_config).await?;

    let engine = OverlayEngine::new(config, transport, Arc::new(tap), dht, local_ips);
    engine.start();

    // Interrupt terminates the process immediately; there is no draining.
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, exiting");
    Ok(())
}
