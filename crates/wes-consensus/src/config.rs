//! Configuration for the aggregation core

use std::time::Duration;

/// Tunables of the aggregation consensus core.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Chain identifier expected on every submission
    pub chain_id: u64,
    /// Duration of the per-height candidate collection window
    pub collection_window: Duration,
    /// Upper bound for result distribution plus local commit
    pub distribution_timeout: Duration,
    /// Heights beyond `local + max_future_skew` are waived
    pub max_future_skew: u64,
    /// Outer retry attempts per forward call
    pub max_retries: u32,
    /// Base backoff between forward attempts
    pub retry_backoff_base: Duration,
    /// Backoff ceiling
    pub retry_backoff_max: Duration,
    /// Backoff multiplier per attempt
    pub retry_backoff_factor: f64,
    /// Initial adaptive call timeout
    pub call_timeout: Duration,
    /// Adaptive timeout floor
    pub min_timeout: Duration,
    /// Adaptive timeout ceiling
    pub max_timeout: Duration,
    /// Backup peers tried after the primary times out
    pub backup_node_count: usize,
    /// Protocol-incompatibility waivers tolerated per submission
    pub max_protocol_retries: u32,
    /// Hard cap on waiver re-elections per submission
    pub max_forward_attempts: u32,
    /// Peers considered by each election
    pub closest_peer_count: usize,
    /// Deadline for any single election
    pub election_timeout: Duration,
    /// Interval between submitter status polls
    pub query_retry_interval: Duration,
    /// Status poll attempts before giving up
    pub max_query_attempts: u32,
    /// Overall submitter poll deadline
    pub query_total_timeout: Duration,
    /// Extra submitter wait on top of window + distribution
    pub network_buffer: Duration,
    /// Below this many topic peers the distributor warns before publishing
    pub required_topic_peers: usize,
    /// Minimum spacing between duplicate re-submissions
    pub confirmation_resubmit_min_interval: Duration,
    /// Allow aggregation with no remote peers at all
    pub allow_single_node_mining: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            collection_window: Duration::from_secs(10),
            distribution_timeout: Duration::from_secs(30),
            max_future_skew: 8,
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(10),
            retry_backoff_factor: 2.0,
            call_timeout: Duration::from_secs(15),
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
            backup_node_count: 2,
            max_protocol_retries: 3,
            max_forward_attempts: 10,
            closest_peer_count: 20,
            election_timeout: Duration::from_secs(3),
            query_retry_interval: Duration::from_secs(15),
            max_query_attempts: 3,
            query_total_timeout: Duration::from_secs(60),
            network_buffer: Duration::from_secs(5),
            required_topic_peers: 3,
            confirmation_resubmit_min_interval: Duration::from_secs(5),
            allow_single_node_mining: false,
        }
    }
}

impl AggregationConfig {
    /// Sets the chain id.
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Sets the collection window duration.
    pub fn with_collection_window(mut self, window: Duration) -> Self {
        self.collection_window = window;
        self
    }

    /// Sets the distribution timeout.
    pub fn with_distribution_timeout(mut self, timeout: Duration) -> Self {
        self.distribution_timeout = timeout;
        self
    }

    /// Sets the future-height skew tolerance.
    pub fn with_max_future_skew(mut self, skew: u64) -> Self {
        self.max_future_skew = skew;
        self
    }

    /// Allows mining with no remote peers.
    pub fn with_single_node_mining(mut self, allow: bool) -> Self {
        self.allow_single_node_mining = allow;
        self
    }
}
