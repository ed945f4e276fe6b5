//! Wire records for the aggregation consensus protocols
//!
//! Field order of every record is stable across versions; new fields are
//! appended and optional so older peers keep decoding.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use wes_types::{Block, BlockBody, BlockHeader, Transaction};

use crate::error::NetworkError;
use crate::peer::PeerId;

/// RPC protocol for forwarding a miner's candidate to the aggregator.
pub const PROTOCOL_BLOCK_SUBMISSION: &str = "/weisyn/consensus/block_submission/1.0.0";
/// RPC protocol for querying an aggregator's per-height status.
pub const PROTOCOL_AGGREGATOR_STATUS: &str = "/weisyn/consensus/aggregator_status/1.0.0";
/// RPC protocol for the consensus heartbeat exchange.
pub const PROTOCOL_HEARTBEAT: &str = "/weisyn/consensus/heartbeat/1.0.0";
/// Pub/sub topic carrying committed-block broadcasts.
pub const TOPIC_LATEST_BLOCK: &str = "weisyn.consensus.latest_block.v1";
/// Internal protocol used to interrogate a peer's supported protocol set.
pub const PROTOCOL_LIST_REQUEST: &str = "/weisyn/protocols/1.0.0";
/// Prefix shared by every WES protocol id.
pub const WES_PROTOCOL_PREFIX: &str = "/weisyn/";

/// Common envelope fields carried by every protocol record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBase {
    /// Unique message identifier chosen by the sender
    pub message_id: u64,
    /// Sender's peer id
    pub sender_id: PeerId,
    /// Unix seconds at send time
    pub timestamp: u64,
}

impl MessageBase {
    /// Creates a base stamped with the current time.
    pub fn new(message_id: u64, sender_id: PeerId) -> Self {
        Self {
            message_id,
            sender_id,
            timestamp: unix_now(),
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serializable block header for network transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireBlockHeader {
    pub height: u64,
    pub previous_hash: [u8; 32],
    pub timestamp: u64,
    pub difficulty: u64,
    pub chain_id: u64,
    pub nonce: u64,
}

/// Serializable block for network transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireBlock {
    pub header: WireBlockHeader,
    pub transactions: Vec<Vec<u8>>,
}

impl From<&Block> for WireBlock {
    fn from(block: &Block) -> Self {
        Self {
            header: WireBlockHeader {
                height: block.header.height,
                previous_hash: *block.header.previous_hash.as_bytes(),
                timestamp: block.header.timestamp,
                difficulty: block.header.difficulty,
                chain_id: block.header.chain_id,
                nonce: block.header.nonce,
            },
            transactions: block
                .body
                .transactions
                .iter()
                .map(|tx| tx.as_bytes().to_vec())
                .collect(),
        }
    }
}

impl WireBlock {
    /// Converts back into the domain block type.
    pub fn into_block(self) -> Block {
        Block::new(
            BlockHeader {
                height: self.header.height,
                previous_hash: wes_primitives::H256::from_bytes(self.header.previous_hash),
                timestamp: self.header.timestamp,
                difficulty: self.header.difficulty,
                chain_id: self.header.chain_id,
                nonce: self.header.nonce,
            },
            BlockBody {
                transactions: self
                    .transactions
                    .into_iter()
                    .map(Transaction::new)
                    .collect(),
            },
        )
    }
}

/// Why an aggregator declined a height.
///
/// A waiver is a first-class protocol outcome: it re-routes the submitter
/// and never counts as a peer failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WaiverReason {
    /// Aggregator is in read-only mode and cannot commit
    ReadOnlyMode,
    /// Aggregator is already running a flow for another height
    AggregationInProgress,
    /// Submitted height is too far beyond the aggregator's tip
    HeightTooFarAhead,
}

impl WaiverReason {
    /// Stable label for metrics and logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            WaiverReason::ReadOnlyMode => "read_only_mode",
            WaiverReason::AggregationInProgress => "aggregation_in_progress",
            WaiverReason::HeightTooFarAhead => "height_too_far_ahead",
        }
    }
}

impl std::fmt::Display for WaiverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Candidate forwarded from a miner to the elected aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinerBlockSubmission {
    pub base: MessageBase,
    pub candidate_block: WireBlock,
    pub miner_peer_id: PeerId,
    pub mining_difficulty: u64,
    pub parent_hash: [u8; 32],
    /// Remaining relay hops; a submission is dropped at zero
    pub relay_hop_limit: u8,
    /// Aggregators that have already waived this submission
    pub waived_aggregators: Vec<PeerId>,
    /// How many times this candidate has been re-routed
    pub retry_attempt: u32,
    /// The miner that produced the candidate, for last-resort routing
    pub original_miner_peer_id: PeerId,
}

/// Aggregator's answer to a block submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatorBlockAcceptance {
    pub base: MessageBase,
    /// Echo of the submission's message id
    pub request_id: u64,
    pub accepted: bool,
    pub acceptance_reason: String,
    pub aggregator_peer_id: PeerId,
    pub waived: bool,
    pub waiver_reason: Option<WaiverReason>,
    /// The aggregator's chain tip when it answered
    pub local_height: u64,
}

impl AggregatorBlockAcceptance {
    /// Acceptance for a candidate the aggregator took into its pool.
    pub fn accepted(base: MessageBase, request_id: u64, local: PeerId, local_height: u64) -> Self {
        Self {
            base,
            request_id,
            accepted: true,
            acceptance_reason: "candidate accepted".to_string(),
            aggregator_peer_id: local,
            waived: false,
            waiver_reason: None,
            local_height,
        }
    }

    /// Hard rejection; the submitter should stop retransmitting.
    pub fn rejected(
        base: MessageBase,
        request_id: u64,
        local: PeerId,
        local_height: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            base,
            request_id,
            accepted: false,
            acceptance_reason: reason.into(),
            aggregator_peer_id: local,
            waived: false,
            waiver_reason: None,
            local_height,
        }
    }

    /// Waiver; the submitter re-elects without penalizing this peer.
    pub fn waived(
        base: MessageBase,
        request_id: u64,
        local: PeerId,
        local_height: u64,
        reason: WaiverReason,
    ) -> Self {
        Self {
            base,
            request_id,
            accepted: false,
            acceptance_reason: format!("waived: {}", reason),
            aggregator_peer_id: local,
            waived: true,
            waiver_reason: Some(reason),
            local_height,
        }
    }
}

/// Aggregator-side view of one height, as reported to status queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AggregationPhase {
    Unknown,
    NotAggregator,
    Collecting,
    Evaluating,
    Distributing,
    Completed,
}

/// Query for an aggregator's view of a height.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatorStatusQuery {
    pub base: MessageBase,
    pub height: u64,
}

/// Answer to an [`AggregatorStatusQuery`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatorStatusResponse {
    pub base: MessageBase,
    pub height: u64,
    pub state: AggregationPhase,
    /// Present when the height is already committed locally
    pub final_block: Option<WireBlock>,
    /// Candidates collected so far, when a window is open
    pub candidate_count: Option<u32>,
    /// Unix milliseconds at which the open window closes
    pub collection_window_end_ms: Option<u64>,
    pub reason: Option<String>,
}

/// Coarse node liveness for heartbeats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Active,
    Syncing,
    Offline,
}

/// Bidirectional consensus heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusHeartbeat {
    pub base: MessageBase,
    pub node_status: NodeStatus,
    pub last_block_height: u64,
    pub last_block_hash: [u8; 32],
    pub connected_peers: u32,
}

/// Summary of the distance selection, embedded in the result broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionResult {
    pub total_candidates: u32,
    pub selected_distance: [u8; 32],
    pub tie_break_applied: bool,
    pub selection_reason: String,
}

/// Committed-block announcement published on the latest-block topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusResultBroadcast {
    pub base: MessageBase,
    pub selected_block_hash: [u8; 32],
    pub final_block: WireBlock,
    pub aggregator_peer_id: PeerId,
    pub decision: DecisionResult,
    pub broadcast_timestamp: u64,
}

/// Encodes a protocol payload with bincode.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, NetworkError> {
    bincode::serialize(msg).map_err(|e| NetworkError::Codec(format!("serialize error: {}", e)))
}

/// Decodes a protocol payload with bincode.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, NetworkError> {
    bincode::deserialize(data).map_err(|e| NetworkError::Codec(format!("deserialize error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wes_primitives::H256;

    fn sample_block(height: u64) -> Block {
        Block::new(
            BlockHeader {
                height,
                previous_hash: H256::from_bytes([9u8; 32]),
                timestamp: 1_700_000_000,
                difficulty: 1000,
                chain_id: 7,
                nonce: 1,
            },
            BlockBody {
                transactions: vec![Transaction::new(vec![1u8, 2, 3])],
            },
        )
    }

    #[test]
    fn test_wire_block_roundtrip() {
        let block = sample_block(42);
        let wire = WireBlock::from(&block);
        assert_eq!(wire.into_block(), block);
    }

    #[test]
    fn test_submission_payload_roundtrip() {
        let local = PeerId::from_bytes([1u8; 32]);
        let msg = MinerBlockSubmission {
            base: MessageBase::new(77, local),
            candidate_block: WireBlock::from(&sample_block(10)),
            miner_peer_id: local,
            mining_difficulty: 1000,
            parent_hash: [9u8; 32],
            relay_hop_limit: 4,
            waived_aggregators: vec![PeerId::from_bytes([2u8; 32])],
            retry_attempt: 1,
            original_miner_peer_id: local,
        };
        let bytes = encode_payload(&msg).unwrap();
        let decoded: MinerBlockSubmission = decode_payload(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_waiver_labels_are_stable() {
        assert_eq!(WaiverReason::ReadOnlyMode.as_label(), "read_only_mode");
        assert_eq!(
            WaiverReason::AggregationInProgress.as_label(),
            "aggregation_in_progress"
        );
        assert_eq!(
            WaiverReason::HeightTooFarAhead.as_label(),
            "height_too_far_ahead"
        );
    }

    #[test]
    fn test_acceptance_constructors() {
        let local = PeerId::from_bytes([3u8; 32]);
        let base = MessageBase::new(1, local);
        let ok = AggregatorBlockAcceptance::accepted(base.clone(), 9, local, 100);
        assert!(ok.accepted && !ok.waived);

        let waived = AggregatorBlockAcceptance::waived(
            base,
            9,
            local,
            100,
            WaiverReason::AggregationInProgress,
        );
        assert!(!waived.accepted && waived.waived);
        assert_eq!(
            waived.waiver_reason,
            Some(WaiverReason::AggregationInProgress)
        );
    }
}
