//! In-memory chain collaborators for the dev node
//!
//! Production deployments plug their own storage, validation and sync
//! implementations into the consensus core; the dev chain keeps a single
//! process functional end to end.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::info;
use wes_consensus::{
    BlockHashService, BlockProcessor, BlockValidator, ChainQuery, ConsensusError, ConsensusResult,
    SyncStatus, WriteGate,
};
use wes_network::message::NodeStatus;
use wes_primitives::H256;
use wes_types::{Block, BlockBody, BlockHeader, ChainInfo, Transaction};

/// SHA-256 block hashing over header fields and transaction payloads.
pub struct Sha256HashService;

impl BlockHashService for Sha256HashService {
    fn compute(&self, block: &Block) -> ConsensusResult<H256> {
        let mut hasher = Sha256::new();
        hasher.update(block.header.height.to_be_bytes());
        hasher.update(block.header.previous_hash.as_bytes());
        hasher.update(block.header.timestamp.to_be_bytes());
        hasher.update(block.header.difficulty.to_be_bytes());
        hasher.update(block.header.chain_id.to_be_bytes());
        hasher.update(block.header.nonce.to_be_bytes());
        for tx in &block.body.transactions {
            hasher.update(tx.as_bytes());
        }
        Ok(H256::from_bytes(hasher.finalize().into()))
    }
}

/// In-memory block store with a genesis block.
pub struct DevChain {
    blocks: RwLock<BTreeMap<u64, Block>>,
}

impl DevChain {
    /// Creates a chain holding only the genesis block.
    pub fn new(chain_id: u64) -> Self {
        let genesis = Block::new(
            BlockHeader {
                height: 0,
                previous_hash: H256::ZERO,
                timestamp: 1_700_000_000,
                difficulty: 0,
                chain_id,
                nonce: 0,
            },
            BlockBody {
                transactions: vec![Transaction::new(b"genesis".to_vec())],
            },
        );
        let mut blocks = BTreeMap::new();
        blocks.insert(0, genesis);
        Self {
            blocks: RwLock::new(blocks),
        }
    }

    /// Current tip height.
    pub fn tip(&self) -> u64 {
        *self.blocks.read().keys().next_back().expect("genesis present")
    }
}

impl ChainQuery for DevChain {
    fn info(&self) -> BoxFuture<'_, ConsensusResult<ChainInfo>> {
        async move {
            let blocks = self.blocks.read();
            let (height, block) = blocks.iter().next_back().expect("genesis present");
            let best_hash = Sha256HashService.compute(block)?;
            Ok(ChainInfo {
                height: *height,
                best_hash,
            })
        }
        .boxed()
    }

    fn get_block(&self, height: u64) -> BoxFuture<'_, ConsensusResult<Option<Block>>> {
        async move { Ok(self.blocks.read().get(&height).cloned()) }.boxed()
    }
}

impl BlockProcessor for DevChain {
    fn process_block<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, ConsensusResult<()>> {
        async move {
            let height = block.header.height;
            let hash = Sha256HashService.compute(block)?;
            let mut blocks = self.blocks.write();

            if let Some(existing) = blocks.get(&height) {
                let existing_hash = Sha256HashService.compute(existing)?;
                if existing_hash == hash {
                    return Ok(());
                }
                return Err(ConsensusError::BlockProcessing(format!(
                    "conflicting block at height {}",
                    height
                )));
            }

            let tip = *blocks.keys().next_back().expect("genesis present");
            if height != tip + 1 {
                return Err(ConsensusError::BlockProcessing(format!(
                    "out of order height {} at tip {}",
                    height, tip
                )));
            }

            blocks.insert(height, block.clone());
            info!(height, hash = %hash.short_hex(), "block committed");
            Ok(())
        }
        .boxed()
    }
}

/// Structural validation for dev candidates.
pub struct DevValidator {
    chain_id: u64,
}

impl DevValidator {
    /// Validator bound to one chain id.
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }
}

impl BlockValidator for DevValidator {
    fn validate_block(&self, block: &Block) -> ConsensusResult<()> {
        if block.header.chain_id != self.chain_id {
            return Err(ConsensusError::InvalidCandidate(format!(
                "chain id {} does not match {}",
                block.header.chain_id, self.chain_id
            )));
        }
        if block.body.transactions.is_empty() {
            return Err(ConsensusError::InvalidCandidate(
                "empty block body".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write gate that always allows.
pub struct OpenWriteGate;

impl WriteGate for OpenWriteGate {
    fn assert_allowed(&self, _reason: &str) -> ConsensusResult<()> {
        Ok(())
    }
}

/// Sync status for a node that is always serving.
pub struct AlwaysActiveSync;

impl SyncStatus for AlwaysActiveSync {
    fn node_status(&self) -> NodeStatus {
        NodeStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<T>(fut: impl std::future::Future<Output = T>) -> T {
        futures::executor::block_on(fut)
    }

    fn next_block(chain: &DevChain, nonce: u64) -> Block {
        let tip = chain.tip();
        Block::new(
            BlockHeader {
                height: tip + 1,
                previous_hash: H256::ZERO,
                timestamp: 1_700_000_100,
                difficulty: 1,
                chain_id: 1,
                nonce,
            },
            BlockBody {
                transactions: vec![Transaction::new(vec![nonce as u8])],
            },
        )
    }

    #[test]
    fn test_commit_advances_tip() {
        let chain = DevChain::new(1);
        let block = next_block(&chain, 5);
        block_on(chain.process_block(&block)).unwrap();
        assert_eq!(chain.tip(), 1);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let chain = DevChain::new(1);
        let block = next_block(&chain, 5);
        block_on(chain.process_block(&block)).unwrap();
        block_on(chain.process_block(&block)).unwrap();
        assert_eq!(chain.tip(), 1);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let chain = DevChain::new(1);
        let mut block = next_block(&chain, 5);
        block.header.height = 4;
        assert!(block_on(chain.process_block(&block)).is_err());
    }

    #[test]
    fn test_conflicting_block_rejected() {
        let chain = DevChain::new(1);
        block_on(chain.process_block(&next_block(&chain, 5))).unwrap();
        let mut conflicting = next_block(&chain, 6);
        conflicting.header.height = 1;
        assert!(block_on(chain.process_block(&conflicting)).is_err());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let chain = DevChain::new(1);
        let block = next_block(&chain, 5);
        let h1 = Sha256HashService.compute(&block).unwrap();
        let h2 = Sha256HashService.compute(&block).unwrap();
        assert_eq!(h1, h2);
        assert!(!h1.is_zero());
    }
}
