//! External collaborator interfaces
//!
//! The aggregation core consumes these; their implementations live in the
//! storage, execution and sync subsystems. The core never computes a block
//! hash itself: two nodes agree on the selected block iff their hash
//! services agree.

use futures::future::BoxFuture;
use wes_network::message::NodeStatus;
use wes_primitives::H256;
use wes_types::{Block, ChainInfo};

use crate::error::ConsensusResult;

/// Read access to the committed chain.
pub trait ChainQuery: Send + Sync {
    /// Current tip snapshot. Monotone in height.
    fn info(&self) -> BoxFuture<'_, ConsensusResult<ChainInfo>>;

    /// Block at `height`; `None` iff the height is beyond the local tip.
    fn get_block(&self, height: u64) -> BoxFuture<'_, ConsensusResult<Option<Block>>>;
}

/// Canonical block hashing, deterministic across the network.
pub trait BlockHashService: Send + Sync {
    /// Computes the hash of a block. A hashing failure is equivalent to
    /// rejecting the block.
    fn compute(&self, block: &Block) -> ConsensusResult<H256>;
}

/// Writes a committed block into the local chain.
pub trait BlockProcessor: Send + Sync {
    /// Idempotent on `(height, hash)`; rejects out-of-order heights.
    fn process_block<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, ConsensusResult<()>>;
}

/// Full block validation, external to the core.
pub trait BlockValidator: Send + Sync {
    /// Accepts or rejects a candidate block.
    fn validate_block(&self, block: &Block) -> ConsensusResult<()>;
}

/// Read-only guard over chain mutation.
pub trait WriteGate: Send + Sync {
    /// `Ok` when writes are allowed, `ConsensusError::ReadOnly` otherwise.
    fn assert_allowed(&self, reason: &str) -> ConsensusResult<()>;
}

/// Node liveness as reconciled with the sync subsystem.
pub trait SyncStatus: Send + Sync {
    /// Coarse node status reported in heartbeats.
    fn node_status(&self) -> NodeStatus;
}

/// Events delivered to the orchestrator from the outside.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// The chain head moved backwards and forwards again
    ChainReorganized {
        /// Head height before the reorg
        old_height: u64,
        /// Head height after the reorg
        new_height: u64,
        /// Number of blocks rewound
        reorg_len: u64,
    },
    /// Network quality observation from the transport layer
    NetworkQualityChanged {
        /// Currently connected peers
        connected_peers: usize,
        /// Whether the network is considered degraded
        degraded: bool,
    },
}
