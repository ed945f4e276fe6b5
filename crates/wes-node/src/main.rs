//! WeiSyn node binary
//!
//! Stands up the aggregation consensus core over the TCP transport with
//! the in-memory dev chain collaborators.

mod chain;
mod cli;
mod config;
mod node;
mod transport;

use anyhow::Result;
use chain::{AlwaysActiveSync, DevChain, DevValidator, OpenWriteGate, Sha256HashService};
use cli::Cli;
use config::NodeConfig;
use node::{Node, NodeDependencies};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wes_network::PeerId;

fn derive_peer_id(seed_hex: &str) -> Result<PeerId> {
    let seed = if seed_hex.is_empty() {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.to_vec()
    } else {
        let trimmed = seed_hex.strip_prefix("0x").unwrap_or(seed_hex);
        hex::decode(trimmed)?
    };
    let digest: [u8; 32] = Sha256::digest(&seed).into();
    Ok(PeerId::from_bytes(digest))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("WeiSyn node starting...");

    let local = derive_peer_id(&cli.node_seed)?;
    let mut config = NodeConfig {
        listen_addr: cli.listen_addr,
        bootstrap_nodes: cli.bootstrap_addrs(),
        ..NodeConfig::default()
    }
    .with_chain_id(cli.chain_id);
    config.consensus = config
        .consensus
        .with_collection_window(Duration::from_secs(cli.collection_window_secs))
        .with_single_node_mining(cli.allow_single_node_mining);

    let chain = Arc::new(DevChain::new(cli.chain_id));
    let deps = NodeDependencies {
        chain: chain.clone(),
        processor: chain.clone(),
        hasher: Arc::new(Sha256HashService),
        validator: Arc::new(DevValidator::new(cli.chain_id)),
        write_gate: Arc::new(OpenWriteGate),
        sync: Arc::new(AlwaysActiveSync),
    };

    let node = Node::new(config, local, deps);
    let bound = node.start().await?;
    tracing::info!(peer = %node.local_peer_id(), %bound, "node ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.stop().await;

    let snapshot = node.metrics_snapshot();
    if let Ok(json) = snapshot.to_json() {
        tracing::debug!(metrics = %json, "final metrics");
    }
    Ok(())
}
