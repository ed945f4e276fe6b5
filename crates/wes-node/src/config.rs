//! Node configuration

use std::net::SocketAddr;
use std::time::Duration;
use wes_consensus::AggregationConfig;

/// Configuration for a WeiSyn node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Chain identifier
    pub chain_id: u64,
    /// P2P listen address
    pub listen_addr: SocketAddr,
    /// Bootstrap peers dialed at startup
    pub bootstrap_nodes: Vec<SocketAddr>,
    /// Dial timeout for outgoing connections
    pub connection_timeout: Duration,
    /// Interval between consensus heartbeats to known peers
    pub heartbeat_interval: Duration,
    /// Interval between peer-health decay sweeps
    pub health_decay_interval: Duration,
    /// Aggregation core tunables
    pub consensus: AggregationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            listen_addr: "0.0.0.0:30400".parse().expect("valid default addr"),
            bootstrap_nodes: Vec::new(),
            connection_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            health_decay_interval: Duration::from_secs(60),
            consensus: AggregationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Sets the listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Adds bootstrap nodes.
    pub fn with_bootstrap_nodes(mut self, nodes: Vec<SocketAddr>) -> Self {
        self.bootstrap_nodes = nodes;
        self
    }

    /// Sets the chain id on the node and the consensus config together.
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self.consensus = self.consensus.with_chain_id(chain_id);
        self
    }
}
