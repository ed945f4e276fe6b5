//! Committed-result distribution over the cluster topic
//!
//! Publication is best-effort: the aggregator has already committed
//! locally, so an empty topic succeeds and a thin topic only warns.
//! Raising both the publish gate and a quorum gate would deadlock the
//! network, so "advance the chain tip" wins.

use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use wes_metrics::Metrics;
use wes_network::message::{
    encode_payload, ConsensusResultBroadcast, DecisionResult, MessageBase, WireBlock,
    TOPIC_LATEST_BLOCK,
};
use wes_network::{PeerId, Transport};

use crate::config::AggregationConfig;
use crate::error::{ConsensusError, ConsensusResult};
use crate::types::{CandidateBlock, DistanceSelectionProof};

/// Maximum tolerated future drift of a selected block's timestamp.
const MAX_FUTURE_DRIFT: Duration = Duration::from_secs(2 * 60);
/// Maximum tolerated staleness of a selected block's timestamp.
const MAX_STALE_DRIFT: Duration = Duration::from_secs(10 * 60);

/// Publishes the selected block to the latest-block topic.
pub struct ResultDistributor {
    local: PeerId,
    transport: Arc<dyn Transport>,
    config: Arc<AggregationConfig>,
    metrics: Arc<Metrics>,
}

impl ResultDistributor {
    /// Creates a distributor publishing through the given transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<AggregationConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local: transport.local_peer_id(),
            transport,
            config,
            metrics,
        }
    }

    /// Builds and publishes the `ConsensusResultBroadcast` for a selected
    /// candidate. Succeeds with zero topic peers.
    pub async fn distribute_selected_block(
        &self,
        selected: &CandidateBlock,
        proof: &DistanceSelectionProof,
        total_candidates: usize,
    ) -> ConsensusResult<()> {
        check_timestamp_sanity(selected.block.header.timestamp)?;

        let selection_reason = if proof.tie_breaking_applied {
            "minimum XOR distance, tie broken by block hash"
        } else {
            "minimum XOR distance"
        };

        let broadcast = ConsensusResultBroadcast {
            base: MessageBase::new(rand::thread_rng().gen(), self.local),
            selected_block_hash: *selected.block_hash.as_bytes(),
            final_block: WireBlock::from(&selected.block),
            aggregator_peer_id: self.local,
            decision: DecisionResult {
                total_candidates: total_candidates as u32,
                selected_distance: *proof.selected_distance.as_bytes(),
                tie_break_applied: proof.tie_breaking_applied,
                selection_reason: selection_reason.to_string(),
            },
            broadcast_timestamp: unix_now(),
        };

        let topic_peers = self.transport.get_topic_peers(TOPIC_LATEST_BLOCK).len();
        if topic_peers == 0 {
            info!(
                height = selected.height,
                hash = %selected.block_hash.short_hex(),
                "no topic peers, skipping broadcast (local commit stands)"
            );
            return Ok(());
        }
        if topic_peers < self.config.required_topic_peers {
            warn!(
                topic_peers,
                required = self.config.required_topic_peers,
                "publishing below required topic peer count"
            );
        }

        let payload = Bytes::from(encode_payload(&broadcast)?);
        tokio::time::timeout(
            self.config.distribution_timeout,
            self.transport.publish(TOPIC_LATEST_BLOCK, payload),
        )
        .await
        .map_err(|_| {
            ConsensusError::PublicationRefused("publish deadline elapsed".to_string())
        })??;

        self.metrics.counter("result_broadcast_total", 1);
        debug!(
            height = selected.height,
            hash = %selected.block_hash.short_hex(),
            topic_peers,
            "consensus result published"
        );
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Rejects publication of blocks with implausible timestamps.
fn check_timestamp_sanity(block_timestamp: u64) -> ConsensusResult<()> {
    let now = unix_now();
    if block_timestamp > now + MAX_FUTURE_DRIFT.as_secs() {
        return Err(ConsensusError::PublicationRefused(format!(
            "block timestamp {} is {}s in the future",
            block_timestamp,
            block_timestamp - now
        )));
    }
    if block_timestamp + MAX_STALE_DRIFT.as_secs() < now {
        return Err(ConsensusError::PublicationRefused(format!(
            "block timestamp {} is {}s stale",
            block_timestamp,
            now - block_timestamp
        )));
    }
    Ok(())
}
