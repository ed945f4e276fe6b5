//! Per-height aggregation orchestration
//!
//! `process_aggregation_round` is the single entry point that wires the
//! routing table, state machine, election, pool, selector, router and
//! distributor together for one height. The flow mutex is held for the
//! whole Listening to Idle span; waiver gates run ahead of it so an
//! overloaded aggregator sheds load within one RPC round-trip.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wes_metrics::Metrics;
use wes_network::message::WaiverReason;
use wes_network::PeerId;
use wes_types::Block;

use crate::config::AggregationConfig;
use crate::distributor::ResultDistributor;
use crate::election::AggregatorElection;
use crate::error::{ConsensusError, ConsensusResult};
use crate::forward::{ForwardService, LoopbackFlow, SubmissionRouter};
use crate::pool::CandidatePool;
use crate::selector::DistanceSelector;
use crate::state::{AggregationState, StateMachine};
use crate::traits::{BlockProcessor, ChainQuery, ConsensusEvent, WriteGate};
use crate::types::{RoundOutcome, SubmissionInfo};
use crate::validator::CandidateGate;

/// Restores the state machine to Idle on every exit path of a flow.
struct IdleGuard<'a> {
    state: &'a StateMachine,
    armed: bool,
}

impl<'a> IdleGuard<'a> {
    fn new(state: &'a StateMachine) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.ensure_idle();
            if self.state.current_state() != AggregationState::Idle {
                error!("state machine failed to recover to idle");
            }
        }
    }
}

/// The aggregation orchestrator (one per node).
pub struct AggregationOrchestrator {
    state: Arc<StateMachine>,
    pool: Arc<CandidatePool>,
    election: Arc<AggregatorElection>,
    distributor: Arc<ResultDistributor>,
    router: Arc<SubmissionRouter>,
    forward: Arc<ForwardService>,
    chain: Arc<dyn ChainQuery>,
    processor: Arc<dyn BlockProcessor>,
    write_gate: Arc<dyn WriteGate>,
    gate: CandidateGate,
    config: Arc<AggregationConfig>,
    metrics: Arc<Metrics>,
    /// Exclusive over one height's Listening to Idle span
    flow_mu: AsyncMutex<()>,
}

impl AggregationOrchestrator {
    /// Wires the orchestrator. Call [`SubmissionRouter::set_loopback`]
    /// with the returned Arc afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateMachine>,
        pool: Arc<CandidatePool>,
        election: Arc<AggregatorElection>,
        distributor: Arc<ResultDistributor>,
        router: Arc<SubmissionRouter>,
        forward: Arc<ForwardService>,
        chain: Arc<dyn ChainQuery>,
        processor: Arc<dyn BlockProcessor>,
        write_gate: Arc<dyn WriteGate>,
        gate: CandidateGate,
        config: Arc<AggregationConfig>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            state,
            pool,
            election,
            distributor,
            router,
            forward,
            chain,
            processor,
            write_gate,
            gate,
            config,
            metrics,
            flow_mu: AsyncMutex::new(()),
        });
        let loopback: Arc<dyn LoopbackFlow> = orchestrator.clone();
        orchestrator.router.set_loopback(Arc::downgrade(&loopback));
        orchestrator
    }

    /// State machine shared with handlers.
    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// Candidate pool shared with handlers.
    pub fn pool(&self) -> &Arc<CandidatePool> {
        &self.pool
    }

    /// Election shared with handlers.
    pub fn election(&self) -> &Arc<AggregatorElection> {
        &self.election
    }

    /// Submission router, for the submitter-side client.
    pub fn router(&self) -> &Arc<SubmissionRouter> {
        &self.router
    }

    fn record_waiver(&self, reason: WaiverReason) {
        self.metrics
            .counter_labeled("waiver_total", reason.as_label(), 1);
    }

    /// Entry point for one candidate at one height.
    ///
    /// Gates run first (write, stale, future, election, busy); only an
    /// elected, idle aggregator takes the flow mutex and runs the
    /// collection window.
    pub async fn process_aggregation_round(
        &self,
        block: Block,
        info: SubmissionInfo,
        source: Option<PeerId>,
        cancel: &CancellationToken,
    ) -> ConsensusResult<RoundOutcome> {
        self.gate.check_candidate(&block)?;
        let height = block.header.height;

        // Write gate: a read-only node waives immediately.
        if let Err(ConsensusError::ReadOnly(reason)) =
            self.write_gate.assert_allowed("process aggregation round")
        {
            debug!(height, %reason, "read-only node waiving submission");
            self.state.ensure_idle();
            self.record_waiver(WaiverReason::ReadOnlyMode);
            let local_height = self.local_height().await;
            return Ok(RoundOutcome::Waived {
                reason: WaiverReason::ReadOnlyMode,
                local_height,
                submitted_height: height,
            });
        }

        // Height gates.
        let local_height = self.chain.info().await?.height;
        if height <= local_height {
            // Common under churn; the submitter should stop retransmitting.
            info!(height, local_height, "stale submission ignored");
            return Ok(RoundOutcome::StaleHeight {
                submitted: height,
                local: local_height,
            });
        }
        if height > local_height + self.config.max_future_skew {
            self.record_waiver(WaiverReason::HeightTooFarAhead);
            return Ok(RoundOutcome::Waived {
                reason: WaiverReason::HeightTooFarAhead,
                local_height,
                submitted_height: height,
            });
        }

        // Election: a node that is not the aggregator forwards.
        let is_aggregator = match self.election.is_aggregator_for_height(height).await {
            Ok(result) => result,
            Err(ConsensusError::ElectionTimeout) => {
                // Election failure counts as "cannot take this height now";
                // the submitter re-elects around us.
                warn!(height, "election timed out, waiving");
                self.record_waiver(WaiverReason::AggregationInProgress);
                return Ok(RoundOutcome::Waived {
                    reason: WaiverReason::AggregationInProgress,
                    local_height,
                    submitted_height: height,
                });
            }
            Err(e) => return Err(e),
        };
        if !is_aggregator {
            return self.router.forward_block(block, info, cancel).await;
        }

        // Busy: one in-flight height per node. Candidates for the height
        // currently collecting still join its window; only other heights
        // are waived.
        let (state, current_height) = self.state.snapshot();
        if state != AggregationState::Idle {
            if current_height == height
                && matches!(
                    state,
                    AggregationState::Listening | AggregationState::Collecting
                )
            {
                let block_hash = self.pool.add_candidate(block, source)?;
                return Ok(RoundOutcome::PooledForCollection { height, block_hash });
            }
            self.record_waiver(WaiverReason::AggregationInProgress);
            return Ok(RoundOutcome::Waived {
                reason: WaiverReason::AggregationInProgress,
                local_height,
                submitted_height: height,
            });
        }

        if self.election.known_peer_count() == 0 && !self.config.allow_single_node_mining {
            return Err(ConsensusError::SingleNodeRefused);
        }

        self.pool.add_candidate(block, source)?;
        self.run_flow(height, cancel.clone()).await
    }

    async fn local_height(&self) -> u64 {
        self.chain
            .info()
            .await
            .map(|info| info.height)
            .unwrap_or(0)
    }

    /// The guarded Listening to Idle span for one height.
    async fn run_flow(
        &self,
        height: u64,
        cancel: CancellationToken,
    ) -> ConsensusResult<RoundOutcome> {
        let _flow = self.flow_mu.lock().await;

        // A racing flow may have committed this height while we waited.
        let tip = self.chain.info().await?.height;
        if tip >= height {
            return Ok(RoundOutcome::StaleHeight {
                submitted: height,
                local: tip,
            });
        }

        let guard = IdleGuard::new(&self.state);

        self.state.transition_to(AggregationState::Listening)?;
        self.state.set_current_height(height);
        self.state.transition_to(AggregationState::Collecting)?;
        self.pool
            .start_collection_window(height, self.config.collection_window);
        let candidates = self.pool.close_collection_window(height, &cancel).await?;
        info!(height, count = candidates.len(), "collection window closed");

        self.state.transition_to(AggregationState::Evaluating)?;
        let parent_hash = self.election.parent_hash(height).await?;
        let distances = DistanceSelector::calculate_distances(&candidates, &parent_hash);

        self.state.transition_to(AggregationState::Selecting)?;
        let outcome = DistanceSelector::select_closest(&distances)?;
        let proof = DistanceSelector::generate_distance_proof(&outcome, &distances);

        self.state.transition_to(AggregationState::Distributing)?;
        self.distributor
            .distribute_selected_block(&outcome.result.candidate, &proof, distances.len())
            .await?;

        // Idempotent local commit; skip when the tip has already moved.
        let tip = self.chain.info().await?.height;
        if tip < height {
            match self.write_gate.assert_allowed("commit selected block") {
                Ok(()) => {
                    self.processor
                        .process_block(&outcome.result.candidate.block)
                        .await?;
                }
                Err(e) => {
                    warn!(height, error = %e, "skipping local commit, relying on sync");
                }
            }
        } else {
            debug!(height, tip, "tip already past selected height, commit skipped");
        }

        self.forward.clear_backup_cache(height);
        self.state.transition_to(AggregationState::Idle)?;
        guard.disarm();

        let block_hash = outcome.result.candidate.block_hash;
        info!(
            height,
            hash = %block_hash.short_hex(),
            tie_break = proof.tie_breaking_applied,
            "aggregation round committed"
        );
        Ok(RoundOutcome::Committed { height, block_hash })
    }

    /// Reacts to external chain and network events.
    pub fn handle_event(&self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::ChainReorganized {
                old_height,
                new_height,
                reorg_len,
            } => {
                warn!(old_height, new_height, reorg_len, "chain reorganized, resetting flow");
                let (_, in_flight) = self.state.snapshot();
                self.pool.drop_window(in_flight);
                self.state.ensure_idle();
                self.state.set_current_height(new_height);
            }
            ConsensusEvent::NetworkQualityChanged {
                connected_peers,
                degraded,
            } => {
                debug!(connected_peers, degraded, "network quality changed");
            }
        }
    }
}

impl LoopbackFlow for AggregationOrchestrator {
    fn execute_aggregation_flow(
        &self,
        height: u64,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ConsensusResult<RoundOutcome>> {
        self.run_flow(height, cancel).boxed()
    }
}
