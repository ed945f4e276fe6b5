//! Deterministic per-height aggregator election
//!
//! `aggregator(h) = argmin_peer XOR(peer_id, SHA256(be(h) ‖ parent_hash))`
//! over peers known to speak the block-submission protocol. Given the same
//! parent hash and peer set, every honest node elects the same peer; peer
//! sets differ across the network, so the submission router (not the
//! election) is what tolerates mis-election.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use wes_metrics::Metrics;
use wes_network::message::PROTOCOL_BLOCK_SUBMISSION;
use wes_network::{PeerId, ProtocolSupport, RoutingTable};
use wes_primitives::H256;

use crate::config::AggregationConfig;
use crate::error::{ConsensusError, ConsensusResult};
use crate::traits::{BlockHashService, ChainQuery};

/// Kademlia target key for one height: `SHA256(be_u64(height) ‖ parent)`.
pub fn routing_key(height: u64, parent_hash: &H256) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(height.to_be_bytes());
    hasher.update(parent_hash.as_bytes());
    hasher.finalize().into()
}

/// Per-height aggregator election over the routing table.
pub struct AggregatorElection {
    local: PeerId,
    routing: Arc<RoutingTable>,
    chain: Arc<dyn ChainQuery>,
    hasher: Arc<dyn BlockHashService>,
    config: Arc<AggregationConfig>,
    metrics: Arc<Metrics>,
}

impl AggregatorElection {
    /// Wires the election against its collaborators.
    pub fn new(
        routing: Arc<RoutingTable>,
        chain: Arc<dyn ChainQuery>,
        hasher: Arc<dyn BlockHashService>,
        config: Arc<AggregationConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local: routing.local_peer_id(),
            routing,
            chain,
            hasher,
            config,
            metrics,
        }
    }

    /// Parent hash for an election at `height`; 32 zero bytes at genesis.
    pub async fn parent_hash(&self, height: u64) -> ConsensusResult<H256> {
        if height == 0 {
            return Ok(H256::ZERO);
        }
        self.metrics.counter("parent_hash_requests_total", 1);
        let started = Instant::now();
        let result = match self.chain.get_block(height - 1).await {
            Ok(Some(block)) => self.hasher.compute(&block),
            Ok(None) => Err(ConsensusError::ChainQuery(format!(
                "parent block {} not available",
                height - 1
            ))),
            Err(e) => Err(e),
        };
        self.metrics
            .histogram("parent_hash_duration_seconds", started.elapsed().as_secs_f64());
        if result.is_err() {
            self.metrics.counter("parent_hash_errors_total", 1);
        }
        result
    }

    /// The elected aggregator for a height.
    pub async fn get_aggregator_for_height(&self, height: u64) -> ConsensusResult<PeerId> {
        self.get_aggregator_for_height_with_waivers(height, &[])
            .await
    }

    /// Election excluding already-waived peers. Returns
    /// `ElectionExhausted` once every candidate has waived; the caller
    /// falls back to the original miner.
    pub async fn get_aggregator_for_height_with_waivers(
        &self,
        height: u64,
        waived: &[PeerId],
    ) -> ConsensusResult<PeerId> {
        tokio::time::timeout(self.config.election_timeout, self.elect(height, waived))
            .await
            .map_err(|_| ConsensusError::ElectionTimeout)?
    }

    async fn elect(&self, height: u64, waived: &[PeerId]) -> ConsensusResult<PeerId> {
        let parent_hash = self.parent_hash(height).await?;
        let key = routing_key(height, &parent_hash);

        // The table lookup already includes the local peer as a candidate.
        let candidates = self
            .routing
            .find_closest_peers(&key, self.config.closest_peer_count);

        let elected = candidates
            .into_iter()
            .filter(|peer| !waived.contains(peer))
            .filter(|peer| {
                // Peers whose protocol set was never learned stay in; the
                // submission router probes them before first use.
                self.routing.supports_protocol(peer, PROTOCOL_BLOCK_SUBMISSION)
                    != ProtocolSupport::Unsupported
            })
            .min_by(|a, b| a.distance(&key).cmp(&b.distance(&key)).then_with(|| a.cmp(b)))
            .ok_or(ConsensusError::ElectionExhausted)?;

        debug!(
            height,
            aggregator = %elected.short_hex(),
            local = elected == self.local,
            waived = waived.len(),
            "aggregator elected"
        );
        Ok(elected)
    }

    /// Whether the local node is the aggregator for a height.
    pub async fn is_aggregator_for_height(&self, height: u64) -> ConsensusResult<bool> {
        Ok(self.get_aggregator_for_height(height).await? == self.local)
    }

    /// A peer is eligible if it is the local node or present in the
    /// routing table.
    pub fn validate_aggregator_eligibility(&self, peer: &PeerId) -> bool {
        *peer == self.local || self.routing.contains(peer)
    }

    /// Local peer id used by this election.
    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    /// Number of remote peers currently known to the routing table.
    pub fn known_peer_count(&self) -> usize {
        self.routing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use wes_types::{Block, BlockBody, BlockHeader, ChainInfo, Transaction};

    struct FixedChain {
        tip: u64,
    }

    impl ChainQuery for FixedChain {
        fn info(&self) -> BoxFuture<'_, ConsensusResult<ChainInfo>> {
            let tip = self.tip;
            async move {
                Ok(ChainInfo {
                    height: tip,
                    best_hash: H256::ZERO,
                })
            }
            .boxed()
        }

        fn get_block(&self, height: u64) -> BoxFuture<'_, ConsensusResult<Option<Block>>> {
            let tip = self.tip;
            async move {
                if height > tip {
                    return Ok(None);
                }
                Ok(Some(Block::new(
                    BlockHeader {
                        height,
                        previous_hash: H256::ZERO,
                        timestamp: 1_700_000_000,
                        difficulty: 1,
                        chain_id: 1,
                        nonce: height,
                    },
                    BlockBody {
                        transactions: vec![Transaction::new(vec![0u8])],
                    },
                )))
            }
            .boxed()
        }
    }

    struct HeightHasher;
    impl BlockHashService for HeightHasher {
        fn compute(&self, block: &Block) -> ConsensusResult<H256> {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&block.header.height.to_be_bytes());
            Ok(H256::from_bytes(bytes))
        }
    }

    fn peer(tag: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        PeerId::from_bytes(bytes)
    }

    fn election_with_peers(local: PeerId, peers: &[PeerId]) -> AggregatorElection {
        let routing = Arc::new(RoutingTable::new(local));
        for p in peers {
            routing.insert_peer(*p);
        }
        AggregatorElection::new(
            routing,
            Arc::new(FixedChain { tip: 1000 }),
            Arc::new(HeightHasher),
            Arc::new(AggregationConfig::default()),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_routing_key_is_domain_separated() {
        let parent = H256::from_bytes([7u8; 32]);
        let k1 = routing_key(10, &parent);
        let k2 = routing_key(11, &parent);
        let k3 = routing_key(10, &H256::from_bytes([8u8; 32]));
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);

        // Bit-exact: SHA256(be(h) || parent).
        let mut hasher = Sha256::new();
        hasher.update(10u64.to_be_bytes());
        hasher.update(parent.as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(k1, expected);
    }

    #[test]
    fn test_genesis_routing_key_uses_zero_parent() {
        let k = routing_key(0, &H256::ZERO);
        let mut hasher = Sha256::new();
        hasher.update(0u64.to_be_bytes());
        hasher.update([0u8; 32]);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(k, expected);
    }

    #[tokio::test]
    async fn test_election_is_deterministic_across_nodes() {
        let all = [peer(1), peer(2), peer(3), peer(4)];
        // Each node sees the other three plus itself.
        let mut elected = Vec::new();
        for local in all {
            let others: Vec<PeerId> = all.iter().copied().filter(|p| *p != local).collect();
            let election = election_with_peers(local, &others);
            elected.push(election.get_aggregator_for_height(42).await.unwrap());
        }
        assert!(elected.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_waivers_exclude_candidates() {
        let local = peer(1);
        let others = [peer(2), peer(3)];
        let election = election_with_peers(local, &others);

        let first = election.get_aggregator_for_height(7).await.unwrap();
        let second = election
            .get_aggregator_for_height_with_waivers(7, &[first])
            .await
            .unwrap();
        assert_ne!(first, second);

        // Waiving everyone exhausts the election.
        let err = election
            .get_aggregator_for_height_with_waivers(7, &[local, peer(2), peer(3)])
            .await
            .unwrap_err();
        assert!(matches!(err, ConsensusError::ElectionExhausted));
    }

    #[tokio::test]
    async fn test_lone_node_elects_itself() {
        let local = peer(9);
        let election = election_with_peers(local, &[]);
        assert!(election.is_aggregator_for_height(5).await.unwrap());
    }

    #[tokio::test]
    async fn test_eligibility() {
        let local = peer(1);
        let election = election_with_peers(local, &[peer(2)]);
        assert!(election.validate_aggregator_eligibility(&local));
        assert!(election.validate_aggregator_eligibility(&peer(2)));
        assert!(!election.validate_aggregator_eligibility(&peer(3)));
    }
}
