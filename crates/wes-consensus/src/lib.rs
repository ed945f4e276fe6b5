//! WeiSyn Aggregation Consensus
//!
//! Two-phase consensus on top of Proof-of-Work: every miner produces a
//! candidate per height, a deterministically elected aggregator collects
//! candidates in a fixed window, and the canonical block is the one whose
//! hash lies closest (by XOR) to a routing key derived from the parent
//! hash.
//!
//! # Components
//!
//! - [`StateMachine`]: 8-state per-height flow with validated transitions
//! - [`AggregatorElection`]: XOR-argmin election over the routing table
//! - [`CandidatePool`]: fixed-duration collection windows
//! - [`DistanceSelector`]: selection plus verifiable proof
//! - [`SubmissionRouter`] / [`ForwardService`]: waiver-tolerant forwarding
//! - [`ConsensusHandlers`]: protocol request handlers
//! - [`ResultDistributor`]: best-effort result broadcast
//! - [`AggregationOrchestrator`]: the per-height flow
//! - [`SubmitterClient`]: submitter-side wait-then-poll reconciliation

#![forbid(unsafe_code)]

pub mod config;
pub mod distributor;
pub mod election;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod orchestrator;
pub mod pool;
pub mod selector;
pub mod state;
pub mod submitter;
pub mod traits;
pub mod types;
pub mod validator;

pub use config::AggregationConfig;
pub use distributor::ResultDistributor;
pub use election::{routing_key, AggregatorElection};
pub use error::{ConsensusError, ConsensusResult};
pub use forward::{ForwardService, LoopbackFlow, SubmissionRouter};
pub use handlers::ConsensusHandlers;
pub use orchestrator::AggregationOrchestrator;
pub use pool::CandidatePool;
pub use selector::{DistanceSelector, SelectionOutcome};
pub use state::{AggregationState, StateMachine};
pub use submitter::{ConfirmationOutcome, ResultNotice, SubmitterClient};
pub use traits::{
    BlockHashService, BlockProcessor, BlockValidator, ChainQuery, ConsensusEvent, SyncStatus,
    WriteGate,
};
pub use types::{
    CandidateBlock, CollectionProgress, DistanceResult, DistanceSelectionProof, RoundOutcome,
    SubmissionInfo,
};
pub use validator::CandidateGate;
