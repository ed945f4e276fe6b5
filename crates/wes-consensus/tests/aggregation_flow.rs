//! End-to-end aggregation flow scenarios over in-memory fakes
//!
//! A single node plays the elected aggregator; the chain, hash service,
//! validator, write gate and transport are all in-memory test doubles.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use wes_consensus::{
    AggregationConfig, AggregationOrchestrator, AggregationState, AggregatorElection,
    BlockHashService, BlockProcessor, BlockValidator, CandidateGate, CandidatePool, ChainQuery,
    ConsensusError, ConsensusHandlers, ConsensusResult, ForwardService, ResultDistributor,
    RoundOutcome, StateMachine, SubmissionInfo, SubmissionRouter, SyncStatus, WriteGate,
};
use wes_network::message::{
    decode_payload, encode_payload, AggregationPhase, AggregatorBlockAcceptance,
    AggregatorStatusQuery, ConsensusResultBroadcast, MessageBase, MinerBlockSubmission,
    NodeStatus, WireBlock,
};
use wes_network::{NetworkResult, PeerId, ProtocolProbe, RoutingTable, Transport};
use wes_primitives::H256;
use wes_types::{Block, BlockBody, BlockHeader, ChainInfo, Transaction};

// ---------------------------------------------------------------------
// Fakes

/// Hash = zero-padded big-endian nonce, so tests can dictate hashes.
struct NonceHasher;

impl BlockHashService for NonceHasher {
    fn compute(&self, block: &Block) -> ConsensusResult<H256> {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&block.header.nonce.to_be_bytes());
        Ok(H256::from_bytes(bytes))
    }
}

fn hash_of(block: &Block) -> H256 {
    NonceHasher.compute(block).unwrap()
}

/// In-memory chain implementing both query and processor sides.
struct MemChain {
    blocks: Mutex<HashMap<u64, Block>>,
    /// get_block calls fail when their 1-based index is in this set
    fail_get_block_on: Mutex<Vec<u64>>,
    get_block_calls: AtomicU64,
}

impl MemChain {
    fn with_genesis() -> Arc<Self> {
        let genesis = make_block(0, 0);
        let mut blocks = HashMap::new();
        blocks.insert(0, genesis);
        Arc::new(Self {
            blocks: Mutex::new(blocks),
            fail_get_block_on: Mutex::new(Vec::new()),
            get_block_calls: AtomicU64::new(0),
        })
    }

    fn tip(&self) -> u64 {
        *self.blocks.lock().keys().max().unwrap()
    }

    fn inject_get_block_fault(&self, call_index: u64) {
        self.fail_get_block_on.lock().push(call_index);
    }
}

impl ChainQuery for MemChain {
    fn info(&self) -> BoxFuture<'_, ConsensusResult<ChainInfo>> {
        async move {
            let tip = self.tip();
            let best_hash = hash_of(&self.blocks.lock()[&tip]);
            Ok(ChainInfo {
                height: tip,
                best_hash,
            })
        }
        .boxed()
    }

    fn get_block(&self, height: u64) -> BoxFuture<'_, ConsensusResult<Option<Block>>> {
        async move {
            let call = self.get_block_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_get_block_on.lock().contains(&call) {
                return Err(ConsensusError::ChainQuery("injected fault".to_string()));
            }
            Ok(self.blocks.lock().get(&height).cloned())
        }
        .boxed()
    }
}

impl BlockProcessor for MemChain {
    fn process_block<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, ConsensusResult<()>> {
        async move {
            let height = block.header.height;
            let mut blocks = self.blocks.lock();
            if let Some(existing) = blocks.get(&height) {
                if hash_of(existing) == hash_of(block) {
                    return Ok(());
                }
                return Err(ConsensusError::BlockProcessing(format!(
                    "conflicting block at height {}",
                    height
                )));
            }
            let tip = *blocks.keys().max().unwrap();
            if height != tip + 1 {
                return Err(ConsensusError::BlockProcessing(format!(
                    "out of order height {} at tip {}",
                    height, tip
                )));
            }
            blocks.insert(height, block.clone());
            Ok(())
        }
        .boxed()
    }
}

struct AcceptAll;
impl BlockValidator for AcceptAll {
    fn validate_block(&self, _block: &Block) -> ConsensusResult<()> {
        Ok(())
    }
}

struct Gate {
    allowed: bool,
}
impl WriteGate for Gate {
    fn assert_allowed(&self, reason: &str) -> ConsensusResult<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(ConsensusError::ReadOnly(reason.to_string()))
        }
    }
}

struct ActiveSync;
impl SyncStatus for ActiveSync {
    fn node_status(&self) -> NodeStatus {
        NodeStatus::Active
    }
}

/// Transport with one topic reader that captures published payloads.
struct CapturingTransport {
    local: PeerId,
    published: Mutex<Vec<Vec<u8>>>,
}

impl CapturingTransport {
    fn new(local: PeerId) -> Self {
        Self {
            local,
            published: Mutex::new(Vec::new()),
        }
    }

    fn broadcasts(&self) -> Vec<ConsensusResultBroadcast> {
        self.published
            .lock()
            .iter()
            .map(|bytes| decode_payload(bytes).unwrap())
            .collect()
    }
}

impl Transport for CapturingTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn call<'a>(
        &'a self,
        peer: PeerId,
        _protocol: &'a str,
        _payload: Bytes,
    ) -> BoxFuture<'a, NetworkResult<Bytes>> {
        async move { Err(wes_network::NetworkError::Unreachable(peer)) }.boxed()
    }

    fn publish<'a>(&'a self, _topic: &'a str, payload: Bytes) -> BoxFuture<'a, NetworkResult<()>> {
        self.published.lock().push(payload.to_vec());
        async move { Ok(()) }.boxed()
    }

    fn get_topic_peers(&self, _topic: &str) -> Vec<PeerId> {
        vec![PeerId::from_bytes([0x99; 32])]
    }
}

struct NoProbe;
impl ProtocolProbe for NoProbe {
    fn probe(&self, _peer: PeerId) -> BoxFuture<'_, NetworkResult<Vec<String>>> {
        async move { Ok(Vec::new()) }.boxed()
    }
}

// ---------------------------------------------------------------------
// Harness

fn make_block(height: u64, nonce: u64) -> Block {
    Block::new(
        BlockHeader {
            height,
            previous_hash: H256::ZERO,
            timestamp: wes_network::message::unix_now(),
            difficulty: 1000,
            chain_id: 1,
            nonce,
        },
        BlockBody {
            transactions: vec![Transaction::new(vec![height as u8, nonce as u8])],
        },
    )
}

struct TestNode {
    orchestrator: Arc<AggregationOrchestrator>,
    handlers: ConsensusHandlers,
    chain: Arc<MemChain>,
    transport: Arc<CapturingTransport>,
    local: PeerId,
}

fn test_node(write_allowed: bool, window: Duration) -> TestNode {
    let local = PeerId::from_bytes([0x11; 32]);
    let chain = MemChain::with_genesis();
    let hasher: Arc<dyn BlockHashService> = Arc::new(NonceHasher);
    let config = Arc::new(
        AggregationConfig::default()
            .with_collection_window(window)
            .with_single_node_mining(true),
    );
    let metrics = Arc::new(wes_metrics::Metrics::new());
    let routing = Arc::new(RoutingTable::new(local));
    let transport = Arc::new(CapturingTransport::new(local));
    let state = Arc::new(StateMachine::new());
    let pool = Arc::new(CandidatePool::new(hasher.clone()));
    let election = Arc::new(AggregatorElection::new(
        routing.clone(),
        chain.clone() as Arc<dyn ChainQuery>,
        hasher,
        config.clone(),
        metrics.clone(),
    ));
    let forward = Arc::new(ForwardService::new(
        transport.clone(),
        routing.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let router = Arc::new(SubmissionRouter::new(
        local,
        election.clone(),
        forward.clone(),
        pool.clone(),
        routing.clone(),
        Arc::new(NoProbe),
        config.clone(),
        metrics.clone(),
    ));
    let distributor = Arc::new(ResultDistributor::new(
        transport.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let validator: Arc<dyn BlockValidator> = Arc::new(AcceptAll);
    let gate = CandidateGate::new(config.chain_id, validator.clone());
    let write_gate: Arc<dyn WriteGate> = Arc::new(Gate {
        allowed: write_allowed,
    });
    let orchestrator = AggregationOrchestrator::new(
        state,
        pool,
        election,
        distributor,
        router,
        forward,
        chain.clone() as Arc<dyn ChainQuery>,
        chain.clone() as Arc<dyn BlockProcessor>,
        write_gate,
        gate,
        config.clone(),
        metrics.clone(),
    );
    let handlers = ConsensusHandlers::new(
        orchestrator.clone(),
        chain.clone() as Arc<dyn ChainQuery>,
        validator,
        chain.clone() as Arc<dyn BlockProcessor>,
        Arc::new(ActiveSync),
        routing,
        config,
        metrics,
    );
    TestNode {
        orchestrator,
        handlers,
        chain,
        transport,
        local,
    }
}

fn info_for(node: &TestNode) -> SubmissionInfo {
    SubmissionInfo::for_local_miner(node.local)
}

// ---------------------------------------------------------------------
// Scenarios

/// Happy path: three candidates, the local node is the aggregator, the
/// XOR-closest candidate wins and is committed and broadcast.
#[tokio::test]
async fn happy_path_selects_xor_closest_of_three() {
    let node = test_node(true, Duration::from_millis(120));
    let cancel = CancellationToken::new();

    // Remote candidates drip in through the orchestrator entry while the
    // window is open; they join the in-flight collection.
    let orchestrator = node.orchestrator.clone();
    let other = PeerId::from_bytes([0x22; 32]);
    let remote_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        for nonce in [2u64, 4] {
            let info = SubmissionInfo {
                waived_aggregators: Vec::new(),
                retry_attempt: 0,
                original_miner_peer_id: other,
            };
            let outcome = orchestrator
                .process_aggregation_round(make_block(1, nonce), info, Some(other), &remote_cancel)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                RoundOutcome::PooledForCollection { height: 1, .. }
            ));
        }
    });

    let outcome = node
        .orchestrator
        .process_aggregation_round(make_block(1, 1), info_for(&node), None, &cancel)
        .await
        .unwrap();

    // Parent is genesis (nonce 0 -> hash 0); distance equals the hash, so
    // nonce 1 wins over 2 and 4.
    let expected = hash_of(&make_block(1, 1));
    match outcome {
        RoundOutcome::Committed { height, block_hash } => {
            assert_eq!(height, 1);
            assert_eq!(block_hash, expected);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(node.chain.tip(), 1);
    assert_eq!(
        node.orchestrator.state().current_state(),
        AggregationState::Idle
    );

    let broadcasts = node.transport.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].final_block.header.nonce, 1);
    assert_eq!(broadcasts[0].decision.total_candidates, 3);
    assert!(!broadcasts[0].decision.tie_break_applied);
}

/// Collection window elapses with only the local candidate: it is
/// trivially selected and committed.
#[tokio::test]
async fn sole_local_candidate_commits() {
    let node = test_node(true, Duration::from_millis(40));
    let cancel = CancellationToken::new();

    let outcome = node
        .orchestrator
        .process_aggregation_round(make_block(1, 7), info_for(&node), None, &cancel)
        .await
        .unwrap();

    assert!(matches!(outcome, RoundOutcome::Committed { height: 1, .. }));
    assert_eq!(node.chain.tip(), 1);
    let broadcasts = node.transport.broadcasts();
    assert_eq!(broadcasts[0].decision.total_candidates, 1);
    assert!(!broadcasts[0].decision.tie_break_applied);
}

/// A dependency fault in the middle of the flow leaves the machine Idle,
/// and the next round for the same height succeeds.
#[tokio::test]
async fn flow_fault_recovers_to_idle() {
    let node = test_node(true, Duration::from_millis(40));
    let cancel = CancellationToken::new();

    // Call 1 resolves the election's parent hash; call 2 is the flow's
    // own parent lookup in Evaluating. Fail the latter.
    node.chain.inject_get_block_fault(2);

    let err = node
        .orchestrator
        .process_aggregation_round(make_block(1, 3), info_for(&node), None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::ChainQuery(_)));
    assert_eq!(
        node.orchestrator.state().current_state(),
        AggregationState::Idle,
        "scope guard must restore idle after a mid-flow fault"
    );
    assert_eq!(node.chain.tip(), 0);

    // Retry the height; no fault this time.
    let outcome = node
        .orchestrator
        .process_aggregation_round(make_block(1, 3), info_for(&node), None, &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, RoundOutcome::Committed { height: 1, .. }));
}

/// Two concurrent rounds for the same height: exactly one commits.
#[tokio::test]
async fn concurrent_rounds_serialize() {
    let node = test_node(true, Duration::from_millis(60));
    let cancel = CancellationToken::new();

    let a = node.orchestrator.clone();
    let b = node.orchestrator.clone();
    let info_a = info_for(&node);
    let info_b = info_for(&node);
    let cancel_a = cancel.clone();
    let cancel_b = cancel.clone();

    let (ra, rb) = tokio::join!(
        async move {
            a.process_aggregation_round(make_block(1, 5), info_a, None, &cancel_a)
                .await
        },
        async move {
            b.process_aggregation_round(make_block(1, 6), info_b, None, &cancel_b)
                .await
        },
    );

    let committed = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r, Ok(RoundOutcome::Committed { .. })))
        .count();
    assert_eq!(committed, 1, "exactly one concurrent flow may commit");
    assert_eq!(node.chain.tip(), 1);
    assert_eq!(
        node.orchestrator.state().current_state(),
        AggregationState::Idle
    );
}

/// Read-only nodes waive instead of aggregating.
#[tokio::test]
async fn read_only_node_waives() {
    let node = test_node(false, Duration::from_millis(40));
    let cancel = CancellationToken::new();

    let outcome = node
        .orchestrator
        .process_aggregation_round(make_block(1, 1), info_for(&node), None, &cancel)
        .await
        .unwrap();

    match outcome {
        RoundOutcome::Waived { reason, .. } => {
            assert_eq!(
                reason,
                wes_network::message::WaiverReason::ReadOnlyMode
            );
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(node.chain.tip(), 0);
}

/// Stale and far-future submissions are gated before any state changes.
#[tokio::test]
async fn height_gates_reject_and_waive() {
    let node = test_node(true, Duration::from_millis(40));
    let cancel = CancellationToken::new();

    // Stale: height 0 is already committed.
    let outcome = node
        .orchestrator
        .process_aggregation_round(make_block(0, 9), info_for(&node), None, &cancel)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RoundOutcome::StaleHeight {
            submitted: 0,
            local: 0
        }
    ));

    // Far future: beyond tip + max_future_skew.
    let outcome = node
        .orchestrator
        .process_aggregation_round(make_block(42, 9), info_for(&node), None, &cancel)
        .await
        .unwrap();
    match outcome {
        RoundOutcome::Waived { reason, .. } => {
            assert_eq!(
                reason,
                wes_network::message::WaiverReason::HeightTooFarAhead
            );
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

// ---------------------------------------------------------------------
// Handler-level scenarios

/// A full submission round-trip through the wire handler.
#[tokio::test]
async fn submission_handler_accepts_and_commits() {
    let node = test_node(true, Duration::from_millis(40));
    let cancel = CancellationToken::new();
    let miner = PeerId::from_bytes([0x33; 32]);

    let block = make_block(1, 2);
    let submission = MinerBlockSubmission {
        base: MessageBase::new(77, miner),
        candidate_block: WireBlock::from(&block),
        miner_peer_id: miner,
        mining_difficulty: block.header.difficulty,
        parent_hash: [0u8; 32],
        relay_hop_limit: 8,
        waived_aggregators: Vec::new(),
        retry_attempt: 0,
        original_miner_peer_id: miner,
    };
    let payload = encode_payload(&submission).unwrap();

    let ack_bytes = node
        .handlers
        .handle_block_submission(&payload, miner, &cancel)
        .await;
    let ack: AggregatorBlockAcceptance = decode_payload(&ack_bytes).unwrap();

    assert!(ack.accepted);
    assert!(!ack.waived);
    assert_eq!(ack.request_id, 77);
    assert_eq!(node.chain.tip(), 1);
}

/// Garbage submissions never crash the handler; they get a rejection.
#[tokio::test]
async fn submission_handler_survives_garbage() {
    let node = test_node(true, Duration::from_millis(40));
    let cancel = CancellationToken::new();
    let from = PeerId::from_bytes([0x44; 32]);

    let ack_bytes = node
        .handlers
        .handle_block_submission(b"definitely not bincode", from, &cancel)
        .await;
    let ack: AggregatorBlockAcceptance = decode_payload(&ack_bytes).unwrap();
    assert!(!ack.accepted);
    assert!(ack.acceptance_reason.contains("invalid message format"));
}

/// Status queries report Completed with the final block once committed.
#[tokio::test]
async fn status_query_reports_completed_height() {
    let node = test_node(true, Duration::from_millis(40));
    let cancel = CancellationToken::new();

    node.orchestrator
        .process_aggregation_round(make_block(1, 2), info_for(&node), None, &cancel)
        .await
        .unwrap();

    let query = AggregatorStatusQuery {
        base: MessageBase::new(5, node.local),
        height: 1,
    };
    let response_bytes = node
        .handlers
        .handle_status_query(&encode_payload(&query).unwrap())
        .await;
    let response: wes_network::message::AggregatorStatusResponse =
        decode_payload(&response_bytes).unwrap();

    assert_eq!(response.state, AggregationPhase::Completed);
    let final_block = response.final_block.expect("committed block attached");
    assert_eq!(final_block.header.height, 1);
    assert_eq!(final_block.header.nonce, 2);
}

/// Result broadcasts from other aggregators are validated and applied.
#[tokio::test]
async fn result_broadcast_applies_remote_block() {
    let node = test_node(true, Duration::from_millis(40));
    let remote = PeerId::from_bytes([0x55; 32]);

    let block = make_block(1, 6);
    let broadcast = ConsensusResultBroadcast {
        base: MessageBase::new(9, remote),
        selected_block_hash: *hash_of(&block).as_bytes(),
        final_block: WireBlock::from(&block),
        aggregator_peer_id: remote,
        decision: wes_network::message::DecisionResult {
            total_candidates: 4,
            selected_distance: [0u8; 32],
            tie_break_applied: false,
            selection_reason: "minimum XOR distance".to_string(),
        },
        broadcast_timestamp: wes_network::message::unix_now(),
    };
    let payload = encode_payload(&broadcast).unwrap();

    let applied = node
        .handlers
        .handle_result_broadcast(&payload, remote)
        .await
        .unwrap();
    assert!(applied.is_some());
    assert_eq!(node.chain.tip(), 1);

    // Self-sent broadcasts are skipped.
    let own = ConsensusResultBroadcast {
        base: MessageBase::new(10, node.local),
        ..broadcast
    };
    let skipped = node
        .handlers
        .handle_result_broadcast(&encode_payload(&own).unwrap(), node.local)
        .await
        .unwrap();
    assert!(skipped.is_none());
}
