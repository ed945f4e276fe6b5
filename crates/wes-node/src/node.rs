//! Node wiring: transport, routing, consensus core and periodic tasks

use bytes::Bytes;
use futures::FutureExt;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wes_consensus::{
    AggregationOrchestrator, AggregatorElection, BlockHashService, BlockProcessor, BlockValidator,
    CandidateGate, CandidatePool, ChainQuery, ConsensusEvent, ConsensusHandlers, ConsensusResult,
    ForwardService, ResultDistributor, ResultNotice, RoundOutcome, StateMachine, SubmissionInfo,
    SubmissionRouter, SubmitterClient, SyncStatus, WriteGate, ConfirmationOutcome,
};
use wes_metrics::{Metrics, MetricsSnapshot};
use wes_network::message::{
    encode_payload, ConsensusHeartbeat, MessageBase, PROTOCOL_AGGREGATOR_STATUS,
    PROTOCOL_BLOCK_SUBMISSION, PROTOCOL_HEARTBEAT, PROTOCOL_LIST_REQUEST, TOPIC_LATEST_BLOCK,
};
use wes_network::{PeerId, RoutingTable};
use wes_primitives::H256;
use wes_types::Block;

use crate::config::NodeConfig;
use crate::transport::TcpTransport;

/// External collaborators injected into the node.
pub struct NodeDependencies {
    /// Committed chain reads
    pub chain: Arc<dyn ChainQuery>,
    /// Block commit path
    pub processor: Arc<dyn BlockProcessor>,
    /// Canonical block hashing
    pub hasher: Arc<dyn BlockHashService>,
    /// Candidate validation
    pub validator: Arc<dyn BlockValidator>,
    /// Read-only guard
    pub write_gate: Arc<dyn WriteGate>,
    /// Sync reconciliation for heartbeats
    pub sync: Arc<dyn SyncStatus>,
}

/// A running WeiSyn consensus node.
pub struct Node {
    config: NodeConfig,
    local: PeerId,
    transport: Arc<TcpTransport>,
    routing: Arc<RoutingTable>,
    orchestrator: Arc<AggregationOrchestrator>,
    submitter: Arc<SubmitterClient>,
    chain: Arc<dyn ChainQuery>,
    sync: Arc<dyn SyncStatus>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Wires a node around the injected collaborators.
    pub fn new(config: NodeConfig, local: PeerId, deps: NodeDependencies) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let consensus_config = Arc::new(config.consensus.clone());
        let routing = Arc::new(RoutingTable::new(local));

        let advertised = vec![
            PROTOCOL_BLOCK_SUBMISSION.to_string(),
            PROTOCOL_AGGREGATOR_STATUS.to_string(),
            PROTOCOL_HEARTBEAT.to_string(),
            PROTOCOL_LIST_REQUEST.to_string(),
            TOPIC_LATEST_BLOCK.to_string(),
        ];
        let transport = TcpTransport::new(
            local,
            advertised,
            routing.clone(),
            config.consensus.max_timeout,
        );

        let state = Arc::new(StateMachine::new());
        let pool = Arc::new(CandidatePool::new(deps.hasher.clone()));
        let election = Arc::new(AggregatorElection::new(
            routing.clone(),
            deps.chain.clone(),
            deps.hasher.clone(),
            consensus_config.clone(),
            metrics.clone(),
        ));
        let forward = Arc::new(ForwardService::new(
            transport.clone(),
            routing.clone(),
            consensus_config.clone(),
            metrics.clone(),
        ));
        let router = Arc::new(SubmissionRouter::new(
            local,
            election.clone(),
            forward.clone(),
            pool.clone(),
            routing.clone(),
            transport.clone(),
            consensus_config.clone(),
            metrics.clone(),
        ));
        let distributor = Arc::new(ResultDistributor::new(
            transport.clone(),
            consensus_config.clone(),
            metrics.clone(),
        ));
        let gate = CandidateGate::new(config.chain_id, deps.validator.clone());
        let orchestrator = AggregationOrchestrator::new(
            state,
            pool,
            election,
            distributor,
            router.clone(),
            forward,
            deps.chain.clone(),
            deps.processor.clone(),
            deps.write_gate.clone(),
            gate,
            consensus_config.clone(),
            metrics.clone(),
        );
        let handlers = Arc::new(ConsensusHandlers::new(
            orchestrator.clone(),
            deps.chain.clone(),
            deps.validator.clone(),
            deps.processor.clone(),
            deps.sync.clone(),
            routing.clone(),
            consensus_config.clone(),
            metrics.clone(),
        ));
        let submitter = Arc::new(SubmitterClient::new(
            transport.clone(),
            router,
            deps.chain.clone(),
            consensus_config,
        ));

        let cancel = CancellationToken::new();
        register_protocol_handlers(&transport, &handlers, &submitter, &cancel);

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            local,
            transport,
            routing,
            orchestrator,
            submitter,
            chain: deps.chain,
            sync: deps.sync,
            metrics,
            cancel,
            shutdown,
        })
    }

    /// Local peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    /// Metrics sink, for export.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::from_metrics(&self.metrics)
    }

    /// Starts the listener, dials bootstrap peers and spawns the
    /// periodic tasks. Returns the bound listen address.
    pub async fn start(self: &Arc<Self>) -> ConsensusResult<std::net::SocketAddr> {
        let bound = self
            .transport
            .start(self.config.listen_addr)
            .await
            .map_err(wes_consensus::ConsensusError::Transport)?;

        for addr in self.config.bootstrap_nodes.clone() {
            if let Err(e) = self
                .transport
                .connect(addr, self.config.connection_timeout)
                .await
            {
                warn!(%addr, error = %e, "bootstrap dial failed");
            }
        }

        self.spawn_health_decay_task();
        self.spawn_heartbeat_task();
        info!(peer = %self.local.short_hex(), %bound, "node started");
        Ok(bound)
    }

    /// Stops the node: cancels in-flight flows and closes the transport.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.cancel.cancel();
        self.transport.stop().await;
        info!("node stopped");
    }

    /// Entry point for a locally mined candidate: aggregate here or
    /// forward, then reconcile until the height is confirmed.
    pub async fn submit_candidate(&self, block: Block) -> ConsensusResult<RoundOutcome> {
        let info = SubmissionInfo::for_local_miner(self.local);
        let outcome = self
            .orchestrator
            .process_aggregation_round(block.clone(), info.clone(), None, &self.cancel)
            .await?;

        if let RoundOutcome::Forwarded { aggregator } = &outcome {
            self.confirm_forwarded(&block, *aggregator, &info).await?;
        }
        Ok(outcome)
    }

    async fn confirm_forwarded(
        &self,
        block: &Block,
        mut aggregator: PeerId,
        info: &SubmissionInfo,
    ) -> ConsensusResult<()> {
        // A re-submission may land on a new aggregator; follow a few hops.
        for _ in 0..3 {
            match self
                .submitter
                .await_confirmation(block, aggregator, info, &self.cancel)
                .await?
            {
                ConfirmationOutcome::Broadcast { block_hash } => {
                    debug!(hash = %block_hash.short_hex(), "height confirmed by broadcast");
                    return Ok(());
                }
                ConfirmationOutcome::StatusConfirmed | ConfirmationOutcome::LocalChain => {
                    return Ok(())
                }
                ConfirmationOutcome::Resubmitted { outcome } => match outcome {
                    RoundOutcome::Forwarded { aggregator: next } => {
                        aggregator = next;
                    }
                    _ => return Ok(()),
                },
            }
        }
        Err(wes_consensus::ConsensusError::ConfirmationTimeout {
            height: block.header.height,
        })
    }

    /// Feeds chain/network events into the orchestrator.
    pub fn handle_event(&self, event: ConsensusEvent) {
        self.orchestrator.handle_event(event);
    }

    /// Chain tip, for status surfaces.
    pub async fn tip(&self) -> ConsensusResult<u64> {
        Ok(self.chain.info().await?.height)
    }

    fn spawn_health_decay_task(self: &Arc<Self>) {
        let routing = self.routing.clone();
        let interval = self.config.health_decay_interval;
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => routing.decay_health(),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.heartbeat_interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.send_heartbeats().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn send_heartbeats(&self) {
        let info = match self.chain.info().await {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "skipping heartbeat round, chain unavailable");
                return;
            }
        };
        let peers = self.transport.connected_peers();
        for peer in peers {
            let heartbeat = ConsensusHeartbeat {
                base: MessageBase::new(rand::thread_rng().gen(), self.local),
                node_status: self.sync.node_status(),
                last_block_height: info.height,
                last_block_hash: *info.best_hash.as_bytes(),
                connected_peers: self.routing.len() as u32,
            };
            let Ok(payload) = encode_payload(&heartbeat) else {
                continue;
            };
            match wes_network::Transport::call(
                self.transport.as_ref(),
                peer,
                PROTOCOL_HEARTBEAT,
                Bytes::from(payload),
            )
            .await
            {
                Ok(_) => self.routing.record_peer_success(peer),
                Err(e) => {
                    debug!(peer = %peer.short_hex(), error = %e, "heartbeat failed");
                    self.routing.record_peer_failure(peer);
                }
            }
        }
    }
}

/// Bridges transport requests into the consensus handlers.
fn register_protocol_handlers(
    transport: &Arc<TcpTransport>,
    handlers: &Arc<ConsensusHandlers>,
    submitter: &Arc<SubmitterClient>,
    cancel: &CancellationToken,
) {
    {
        let handlers = handlers.clone();
        let cancel = cancel.clone();
        transport.register_handler(
            PROTOCOL_BLOCK_SUBMISSION,
            Arc::new(move |peer, payload| {
                let handlers = handlers.clone();
                let cancel = cancel.clone();
                async move {
                    Ok(handlers
                        .handle_block_submission(&payload, peer, &cancel)
                        .await)
                }
                .boxed()
            }),
        );
    }
    {
        let handlers = handlers.clone();
        transport.register_handler(
            PROTOCOL_AGGREGATOR_STATUS,
            Arc::new(move |_peer, payload| {
                let handlers = handlers.clone();
                async move { Ok(handlers.handle_status_query(&payload).await) }.boxed()
            }),
        );
    }
    {
        let handlers = handlers.clone();
        transport.register_handler(
            PROTOCOL_HEARTBEAT,
            Arc::new(move |_peer, payload| {
                let handlers = handlers.clone();
                async move { Ok(handlers.handle_heartbeat(&payload).await) }.boxed()
            }),
        );
    }
    {
        let handlers = handlers.clone();
        let submitter = submitter.clone();
        transport.set_publish_handler(Arc::new(move |peer, topic, payload| {
            let handlers = handlers.clone();
            let submitter = submitter.clone();
            async move {
                if topic != TOPIC_LATEST_BLOCK {
                    debug!(%topic, "ignoring publish on unknown topic");
                    return;
                }
                match handlers.handle_result_broadcast(&payload, peer).await {
                    Ok(Some(broadcast)) => {
                        submitter.notify_result(ResultNotice {
                            height: broadcast.final_block.header.height,
                            block_hash: H256::from_bytes(broadcast.selected_block_hash),
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(error = %e, "result broadcast not applied");
                    }
                }
            }
            .boxed()
        }));
    }
}
