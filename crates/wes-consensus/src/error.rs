//! Consensus error types

use crate::state::AggregationState;
use thiserror::Error;
use wes_network::{NetworkError, PeerId};

/// Errors surfaced by the aggregation consensus core.
///
/// Waivers are not represented here: they are a first-class outcome (see
/// `RoundOutcome::Waived`) so callers re-route instead of failing.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A required collaborator was not injected
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    /// Transport-level failure, retried by the forwarding policy
    #[error("transport error: {0}")]
    Transport(#[from] NetworkError),

    /// The local node is in read-only mode
    #[error("write gate closed: {0}")]
    ReadOnly(String),

    /// Submission for a height at or below the local tip
    #[error("stale height: submitted {submitted}, local tip {local}")]
    StaleHeight {
        /// Submitted height
        submitted: u64,
        /// Local chain tip
        local: u64,
    },

    /// Illegal state machine transition request
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: AggregationState,
        /// Requested state
        to: AggregationState,
    },

    /// Every election candidate has been waived
    #[error("election exhausted: all candidate aggregators waived")]
    ElectionExhausted,

    /// Election did not finish within its deadline
    #[error("election timed out")]
    ElectionTimeout,

    /// Target peer does not speak the required protocol
    #[error("peer {peer} does not support {protocol}")]
    ProtocolIncompatible {
        /// The incompatible peer
        peer: PeerId,
        /// Required protocol id
        protocol: String,
    },

    /// Forwarding gave up after exhausting retries and waiver re-elections
    #[error("submission routing exhausted after {attempts} attempts")]
    RoutingExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// The aggregator rejected the submission outright
    #[error("submission rejected: {reason} (aggregator tip {local_height})")]
    SubmissionRejected {
        /// Reason string from the acceptance message
        reason: String,
        /// Aggregator's chain tip
        local_height: u64,
    },

    /// Candidate set was empty or otherwise unusable
    #[error("selection failed: {0}")]
    SelectionFailed(String),

    /// Distance proof did not verify
    #[error("proof verification failed: {0}")]
    ProofVerification(String),

    /// Block hash service failure; equivalent to rejecting the block
    #[error("block hash service: {0}")]
    HashService(String),

    /// Chain query failure
    #[error("chain query: {0}")]
    ChainQuery(String),

    /// Candidate refused before the flow began
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Aggregating with no remote peers is disabled by configuration
    #[error("no remote peers and single-node mining is disabled")]
    SingleNodeRefused,

    /// Block processing failure from the external processor
    #[error("block processing: {0}")]
    BlockProcessing(String),

    /// Result publication refused by the distributor's sanity checks
    #[error("publication refused: {0}")]
    PublicationRefused(String),

    /// Submitter-side confirmation did not complete in time
    #[error("confirmation timed out for height {height}")]
    ConfirmationTimeout {
        /// Height awaiting confirmation
        height: u64,
    },

    /// Operation cancelled via its cancellation token
    #[error("operation cancelled")]
    Cancelled,
}

impl ConsensusError {
    /// Whether retrying (possibly against another peer) can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsensusError::Transport(e) => e.is_retryable(),
            ConsensusError::ChainQuery(_) => true,
            _ => false,
        }
    }
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
