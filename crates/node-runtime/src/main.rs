//! # Helix Node
//!
//! Entry point: loads (or creates) the JSON configuration, installs
//! logging, builds the node and runs it until interrupted.

use anyhow::Result;
use node_runtime::{Node, NodeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("===========================================");
    info!("  Helix Node Runtime v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");

    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::load(&path)?,
        None => {
            info!("no config given, running with defaults");
            NodeConfig::default()
        }
    };

    let node = Node::build(config)?;
    node.start();

    info!("node is running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown();
    Ok(())
}
