//! Pre-flow candidate gate
//!
//! Malformed candidates are refused before any state is touched; the
//! heavy validation itself is owned by the external block validator.

use std::sync::Arc;
use tracing::debug;
use wes_types::Block;

use crate::error::{ConsensusError, ConsensusResult};
use crate::traits::BlockValidator;

/// Structural checks plus delegation to the external validator.
pub struct CandidateGate {
    chain_id: u64,
    validator: Arc<dyn BlockValidator>,
}

impl CandidateGate {
    /// Creates the gate for a chain id.
    pub fn new(chain_id: u64, validator: Arc<dyn BlockValidator>) -> Self {
        Self {
            chain_id,
            validator,
        }
    }

    /// Refuses a candidate that cannot possibly enter aggregation.
    pub fn check_candidate(&self, block: &Block) -> ConsensusResult<()> {
        if block.header.chain_id != self.chain_id {
            return Err(ConsensusError::InvalidCandidate(format!(
                "chain id {} does not match local chain {}",
                block.header.chain_id, self.chain_id
            )));
        }
        if block.header.timestamp == 0 {
            return Err(ConsensusError::InvalidCandidate(
                "zero block timestamp".to_string(),
            ));
        }
        if block.body.transactions.is_empty() {
            return Err(ConsensusError::InvalidCandidate(
                "candidate body carries no transactions".to_string(),
            ));
        }

        self.validator.validate_block(block).map_err(|e| {
            debug!(height = block.header.height, error = %e, "candidate refused by validator");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wes_primitives::H256;
    use wes_types::{BlockBody, BlockHeader, Transaction};

    struct AcceptAll;
    impl BlockValidator for AcceptAll {
        fn validate_block(&self, _block: &Block) -> ConsensusResult<()> {
            Ok(())
        }
    }

    struct RejectAll;
    impl BlockValidator for RejectAll {
        fn validate_block(&self, _block: &Block) -> ConsensusResult<()> {
            Err(ConsensusError::InvalidCandidate("pow check failed".into()))
        }
    }

    fn block(chain_id: u64) -> Block {
        Block::new(
            BlockHeader {
                height: 5,
                previous_hash: H256::ZERO,
                timestamp: 1_700_000_000,
                difficulty: 1,
                chain_id,
                nonce: 0,
            },
            BlockBody {
                transactions: vec![Transaction::new(vec![1u8])],
            },
        )
    }

    #[test]
    fn test_accepts_well_formed() {
        let gate = CandidateGate::new(1, Arc::new(AcceptAll));
        gate.check_candidate(&block(1)).unwrap();
    }

    #[test]
    fn test_rejects_wrong_chain() {
        let gate = CandidateGate::new(1, Arc::new(AcceptAll));
        assert!(gate.check_candidate(&block(2)).is_err());
    }

    #[test]
    fn test_rejects_empty_body() {
        let gate = CandidateGate::new(1, Arc::new(AcceptAll));
        let mut b = block(1);
        b.body.transactions.clear();
        assert!(gate.check_candidate(&b).is_err());
    }

    #[test]
    fn test_delegates_to_external_validator() {
        let gate = CandidateGate::new(1, Arc::new(RejectAll));
        assert!(matches!(
            gate.check_candidate(&block(1)),
            Err(ConsensusError::InvalidCandidate(_))
        ));
    }
}
