//! CLI argument parsing for wes-node

use clap::Parser;
use std::net::SocketAddr;

/// WeiSyn consensus node
#[derive(Parser, Debug, Clone)]
#[command(name = "weisyn")]
#[command(about = "WeiSyn aggregation consensus node")]
#[command(version)]
pub struct Cli {
    /// Chain ID
    #[arg(long, default_value = "1")]
    pub chain_id: u64,

    /// P2P listen address
    #[arg(long, default_value = "0.0.0.0:30400")]
    pub listen_addr: SocketAddr,

    /// Bootstrap peer addresses (comma-separated, e.g. "1.2.3.4:30400,5.6.7.8:30400")
    #[arg(long, default_value = "")]
    pub bootnodes: String,

    /// Candidate collection window in seconds
    #[arg(long, default_value = "10")]
    pub collection_window_secs: u64,

    /// Allow aggregating with no remote peers
    #[arg(long, default_value_t = false)]
    pub allow_single_node_mining: bool,

    /// Node private seed (hex, 32 bytes) used to derive the peer id;
    /// random if not given
    #[arg(long, default_value = "")]
    pub node_seed: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parses process arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Bootstrap addresses parsed out of the comma-separated flag.
    pub fn bootstrap_addrs(&self) -> Vec<SocketAddr> {
        self.bootnodes
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}
