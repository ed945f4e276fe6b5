//! Domain types of the aggregation core

use std::time::Instant;
use wes_network::message::WaiverReason;
use wes_network::PeerId;
use wes_primitives::H256;
use wes_types::Block;

/// A PoW-valid block offered for one height.
///
/// Identity is `block_hash`; the pool dedups on it.
#[derive(Debug, Clone)]
pub struct CandidateBlock {
    /// The candidate block itself
    pub block: Block,
    /// Hash computed by the external hash service
    pub block_hash: H256,
    /// Height the candidate competes for; always `block.header.height`
    pub height: u64,
    /// Peer the candidate arrived from; `None` for the local miner
    pub source_peer: Option<PeerId>,
    /// Monotonic arrival timestamp
    pub received_at: Instant,
}

impl CandidateBlock {
    /// Builds a candidate; the height is taken from the block header.
    pub fn new(block: Block, block_hash: H256, source_peer: Option<PeerId>) -> Self {
        let height = block.header.height;
        Self {
            block,
            block_hash,
            height,
            source_peer,
            received_at: Instant::now(),
        }
    }
}

/// A candidate together with its XOR distance to the parent hash.
#[derive(Debug, Clone)]
pub struct DistanceResult {
    /// The measured candidate
    pub candidate: CandidateBlock,
    /// `block_hash XOR parent_hash`
    pub distance: H256,
}

/// Verifiable summary of a distance selection.
///
/// Any third party holding the candidate set and the parent hash can
/// reproduce `distance_summary_hash` and `proof_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceSelectionProof {
    /// Hash of the selected candidate
    pub selected_hash: H256,
    /// XOR distance of the selected candidate to the parent hash
    pub selected_distance: H256,
    /// SHA-256 over all (hash, distance) pairs sorted by hash
    pub distance_summary_hash: H256,
    /// Unix seconds at proof generation
    pub generated_at: u64,
    /// Whether the lexicographic tie-break decided the winner
    pub tie_breaking_applied: bool,
    /// SHA-256 of (selected_hash, selected_distance, summary hash)
    pub proof_hash: H256,
}

/// Routing context that travels with a candidate between hops.
///
/// Not serialized at the first hop; reconstructed from each
/// `MinerBlockSubmission` on the aggregator side.
#[derive(Debug, Clone)]
pub struct SubmissionInfo {
    /// Aggregators that have waived this candidate so far
    pub waived_aggregators: Vec<PeerId>,
    /// How many times the candidate has been re-routed
    pub retry_attempt: u32,
    /// The miner that produced the candidate
    pub original_miner_peer_id: PeerId,
}

impl SubmissionInfo {
    /// Fresh context for a locally mined candidate.
    pub fn for_local_miner(local: PeerId) -> Self {
        Self {
            waived_aggregators: Vec::new(),
            retry_attempt: 0,
            original_miner_peer_id: local,
        }
    }
}

/// What one `process_aggregation_round` call resolved to.
#[derive(Debug, Clone)]
pub enum RoundOutcome {
    /// The local node aggregated and committed the height
    Committed {
        /// Committed height
        height: u64,
        /// Hash of the selected block
        block_hash: H256,
    },
    /// The candidate was forwarded to and accepted by a remote aggregator
    Forwarded {
        /// Accepting aggregator
        aggregator: PeerId,
    },
    /// The candidate joined an already-open collection window for its
    /// height; the in-flight flow will consider it
    PooledForCollection {
        /// Height whose window took the candidate
        height: u64,
        /// Deduplicated candidate hash
        block_hash: H256,
    },
    /// The local node declined the height
    Waived {
        /// Why the height was declined
        reason: WaiverReason,
        /// Local chain tip at decision time
        local_height: u64,
        /// Height that was submitted
        submitted_height: u64,
    },
    /// Submission arrived at or below the local tip
    StaleHeight {
        /// Submitted height
        submitted: u64,
        /// Local chain tip
        local: u64,
    },
}

/// Progress report for an open collection window.
#[derive(Debug, Clone, Copy)]
pub struct CollectionProgress {
    /// Candidates collected so far
    pub candidate_count: usize,
    /// Time until the window closes; zero if already past
    pub remaining: std::time::Duration,
}
