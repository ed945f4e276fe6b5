//! Chain tip information

use serde::{Deserialize, Serialize};
use wes_primitives::H256;

/// Snapshot of the local chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Height of the latest committed block
    pub height: u64,
    /// Hash of the latest committed block
    pub best_hash: H256,
}

impl ChainInfo {
    /// Chain info for an empty chain (genesis not yet written).
    pub fn genesis() -> Self {
        Self {
            height: 0,
            best_hash: H256::ZERO,
        }
    }
}
