//! Candidate forwarding from non-aggregator miners to the elected
//! aggregator
//!
//! Two layers: [`ForwardService`] owns the per-call policy (adaptive
//! timeout, backup peers, bounded backoff), [`SubmissionRouter`] owns the
//! waiver loop (re-election with an explicit waiver set, protocol checks
//! with quarantine, loopback into the local flow as last resort).

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wes_metrics::Metrics;
use wes_network::message::{
    decode_payload, encode_payload, AggregatorBlockAcceptance, MessageBase, MinerBlockSubmission,
    WireBlock, PROTOCOL_BLOCK_SUBMISSION,
};
use wes_network::{NetworkError, PeerId, ProtocolProbe, ProtocolSupport, RoutingTable, Transport};
use wes_types::Block;

use crate::config::AggregationConfig;
use crate::election::AggregatorElection;
use crate::error::{ConsensusError, ConsensusResult};
use crate::pool::CandidatePool;
use crate::types::{RoundOutcome, SubmissionInfo};

/// Relay hop allowance stamped onto outgoing submissions.
const RELAY_HOP_LIMIT: u8 = 8;

/// Entry point back into the local aggregation flow, implemented by the
/// orchestrator. Held behind a `Weak` so the router and the orchestrator
/// do not keep each other alive.
pub trait LoopbackFlow: Send + Sync {
    /// Runs the full local aggregation flow for a height.
    fn execute_aggregation_flow(
        &self,
        height: u64,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, ConsensusResult<RoundOutcome>>;
}

/// Per-call forwarding policy: adaptive timeout, backups, backoff.
pub struct ForwardService {
    transport: Arc<dyn Transport>,
    routing: Arc<RoutingTable>,
    config: Arc<AggregationConfig>,
    metrics: Arc<Metrics>,
    current_timeout: Mutex<Duration>,
    backup_cache: RwLock<HashMap<u64, Vec<PeerId>>>,
}

impl ForwardService {
    /// Creates the service with the configured initial timeout.
    pub fn new(
        transport: Arc<dyn Transport>,
        routing: Arc<RoutingTable>,
        config: Arc<AggregationConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let current_timeout = Mutex::new(config.call_timeout);
        Self {
            transport,
            routing,
            config,
            metrics,
            current_timeout,
            backup_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The adaptive timeout currently in effect.
    pub fn current_timeout(&self) -> Duration {
        *self.current_timeout.lock()
    }

    fn adapt_on_success(&self) {
        let mut timeout = self.current_timeout.lock();
        *timeout = timeout.mul_f64(0.95).max(self.config.min_timeout);
        self.metrics
            .gauge("current_timeout_seconds", timeout.as_secs() as i64);
    }

    fn adapt_on_timeout(&self) {
        let mut timeout = self.current_timeout.lock();
        *timeout = timeout.mul_f64(1.2).min(self.config.max_timeout);
        self.metrics
            .gauge("current_timeout_seconds", timeout.as_secs() as i64);
    }

    /// Backup peers for a primary, cached per height so retries stay
    /// coherent across one aggregation round.
    fn backups_for(&self, height: u64, primary: PeerId) -> Vec<PeerId> {
        if let Some(cached) = self.backup_cache.read().get(&height) {
            return cached.clone();
        }
        let backups: Vec<PeerId> = self
            .routing
            .find_closest_peers(primary.as_bytes(), self.config.backup_node_count + 1)
            .into_iter()
            .filter(|p| *p != primary && *p != self.transport.local_peer_id())
            .take(self.config.backup_node_count)
            .collect();
        self.backup_cache.write().insert(height, backups.clone());
        backups
    }

    /// Purges the backup cache for a committed height.
    pub fn clear_backup_cache(&self, height: u64) {
        self.backup_cache.write().remove(&height);
    }

    /// Calls the primary under the adaptive timeout, falling back to
    /// backup peers on timeout, with exponential backoff between attempts.
    pub async fn call_with_backups(
        &self,
        primary: PeerId,
        protocol: &str,
        payload: Bytes,
        height: u64,
        cancel: &CancellationToken,
    ) -> ConsensusResult<Bytes> {
        let mut targets = vec![primary];
        targets.extend(self.backups_for(height, primary));

        self.metrics.counter("forward_total", 1);
        let mut last_error = None;

        for attempt in 0..self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(ConsensusError::Cancelled);
            }
            if attempt > 0 {
                self.metrics.counter("forward_retry", 1);
                let backoff = backoff_delay(
                    self.config.retry_backoff_base,
                    self.config.retry_backoff_factor,
                    self.config.retry_backoff_max,
                    attempt - 1,
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
                }
            }

            let target = targets[attempt as usize % targets.len()];
            let timeout = self.current_timeout();
            let call = self.transport.call(target, protocol, payload.clone());

            let outcome = tokio::select! {
                result = tokio::time::timeout(timeout, call) => result,
                _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            };

            match outcome {
                Ok(Ok(response)) => {
                    self.adapt_on_success();
                    self.metrics.counter("forward_success", 1);
                    if target != primary {
                        debug!(
                            primary = %primary.short_hex(),
                            backup = %target.short_hex(),
                            "forward succeeded via backup peer"
                        );
                    }
                    return Ok(response);
                }
                Ok(Err(e)) if e.is_timeout() => {
                    self.adapt_on_timeout();
                    self.metrics.counter("forward_timeout", 1);
                    debug!(target = %target.short_hex(), attempt, "forward call timed out");
                    last_error = Some(e);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    self.metrics.counter("forward_failed", 1);
                    debug!(target = %target.short_hex(), attempt, error = %e, "forward call failed");
                    last_error = Some(e);
                }
                Ok(Err(e)) => {
                    self.metrics.counter("forward_failed", 1);
                    return Err(ConsensusError::Transport(e));
                }
                Err(_) => {
                    self.adapt_on_timeout();
                    self.metrics.counter("forward_timeout", 1);
                    debug!(target = %target.short_hex(), attempt, "forward deadline elapsed");
                    last_error = Some(NetworkError::Timeout {
                        peer: target,
                        protocol: protocol.to_string(),
                    });
                }
            }
        }

        self.metrics.counter("forward_failed", 1);
        Err(ConsensusError::Transport(last_error.unwrap_or(
            NetworkError::Unreachable(primary),
        )))
    }
}

/// Exponential backoff with a hard ceiling.
fn backoff_delay(base: Duration, factor: f64, max: Duration, exponent: u32) -> Duration {
    let scaled = base.mul_f64(factor.powi(exponent as i32));
    scaled.min(max)
}

/// Routes a candidate to the elected aggregator, tolerating waivers,
/// offline peers and protocol incompatibility.
pub struct SubmissionRouter {
    local: PeerId,
    election: Arc<AggregatorElection>,
    forward: Arc<ForwardService>,
    pool: Arc<CandidatePool>,
    routing: Arc<RoutingTable>,
    probe: Arc<dyn ProtocolProbe>,
    config: Arc<AggregationConfig>,
    metrics: Arc<Metrics>,
    loopback: RwLock<Option<Weak<dyn LoopbackFlow>>>,
}

impl SubmissionRouter {
    /// Wires the router; the loopback is injected later to break the
    /// orchestrator cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerId,
        election: Arc<AggregatorElection>,
        forward: Arc<ForwardService>,
        pool: Arc<CandidatePool>,
        routing: Arc<RoutingTable>,
        probe: Arc<dyn ProtocolProbe>,
        config: Arc<AggregationConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local,
            election,
            forward,
            pool,
            routing,
            probe,
            config,
            metrics,
            loopback: RwLock::new(None),
        }
    }

    /// Injects the orchestrator callback for the loopback path.
    pub fn set_loopback(&self, flow: Weak<dyn LoopbackFlow>) {
        *self.loopback.write() = Some(flow);
    }

    async fn run_local_flow(
        &self,
        block: &Block,
        cancel: &CancellationToken,
    ) -> ConsensusResult<RoundOutcome> {
        let height = block.header.height;
        self.pool.add_candidate(block.clone(), Some(self.local))?;
        let flow = self
            .loopback
            .read()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .ok_or(ConsensusError::MissingDependency("aggregation flow loopback"))?;
        flow.execute_aggregation_flow(height, cancel.clone()).await
    }

    /// Forwards a candidate to the elected aggregator.
    ///
    /// Terminates with a definite outcome within
    /// `max_forward_attempts` waiver re-elections: acceptance, a local
    /// flow via loopback or original-miner fallback, or an error.
    pub async fn forward_block(
        &self,
        block: Block,
        info: SubmissionInfo,
        cancel: &CancellationToken,
    ) -> ConsensusResult<RoundOutcome> {
        let height = block.header.height;
        let mut waived = info.waived_aggregators.clone();
        let mut attempt = info.retry_attempt;
        let mut protocol_retries: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ConsensusError::Cancelled);
            }

            if attempt >= self.config.max_forward_attempts {
                // Aggregator of last resort: the original miner.
                if info.original_miner_peer_id == self.local {
                    info!(height, "waiver loop exhausted, running aggregation locally");
                    return self.run_local_flow(&block, cancel).await;
                }
                return Err(ConsensusError::RoutingExhausted { attempts: attempt });
            }

            let target = match self
                .election
                .get_aggregator_for_height_with_waivers(height, &waived)
                .await
            {
                Ok(target) => target,
                Err(ConsensusError::ElectionExhausted) => {
                    if info.original_miner_peer_id == self.local {
                        info!(height, "all aggregators waived, running aggregation locally");
                        return self.run_local_flow(&block, cancel).await;
                    }
                    return Err(ConsensusError::ElectionExhausted);
                }
                Err(e) => return Err(e),
            };

            // Loopback short-circuit: after enough waivers the election
            // lands back on this node.
            if target == self.local {
                return self.run_local_flow(&block, cancel).await;
            }

            if !self.ensure_protocol(target).await {
                let analysis = self
                    .routing
                    .quarantine_with_analysis(target, PROTOCOL_BLOCK_SUBMISSION);
                debug!(
                    height,
                    target = %target.short_hex(),
                    peer_type = ?analysis.peer_type,
                    "elected aggregator incompatible, re-electing"
                );
                waived.push(target);
                protocol_retries += 1;
                if protocol_retries > self.config.max_protocol_retries {
                    return Err(ConsensusError::ProtocolIncompatible {
                        peer: target,
                        protocol: PROTOCOL_BLOCK_SUBMISSION.to_string(),
                    });
                }
                continue;
            }

            let submission = self.build_submission(&block, &waived, attempt + 1, &info).await?;
            let payload = Bytes::from(encode_payload(&submission)?);

            let response = match self
                .forward
                .call_with_backups(target, PROTOCOL_BLOCK_SUBMISSION, payload, height, cancel)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.routing.record_peer_failure(target);
                    return Err(e);
                }
            };

            let ack: AggregatorBlockAcceptance = decode_payload(&response)?;

            if ack.accepted && !ack.waived {
                self.routing.record_peer_success(target);
                info!(
                    height,
                    aggregator = %target.short_hex(),
                    "candidate accepted by aggregator"
                );
                return Ok(RoundOutcome::Forwarded { aggregator: target });
            }

            if ack.waived {
                // Waivers are legitimate; no health penalty.
                if let Some(reason) = ack.waiver_reason {
                    self.metrics.counter_labeled("waiver_total", reason.as_label(), 1);
                    debug!(
                        height,
                        aggregator = %target.short_hex(),
                        reason = %reason,
                        aggregator_tip = ack.local_height,
                        "aggregator waived, re-electing"
                    );
                }
                waived.push(target);
                attempt += 1;
                continue;
            }

            // Rejected outright, e.g. stale height: stop retransmitting.
            warn!(
                height,
                aggregator = %target.short_hex(),
                reason = %ack.acceptance_reason,
                "submission rejected"
            );
            return Err(ConsensusError::SubmissionRejected {
                reason: ack.acceptance_reason,
                local_height: ack.local_height,
            });
        }
    }

    /// Fast-path protocol check with a single cache refresh.
    async fn ensure_protocol(&self, target: PeerId) -> bool {
        match self
            .routing
            .supports_protocol(&target, PROTOCOL_BLOCK_SUBMISSION)
        {
            ProtocolSupport::Supported => true,
            ProtocolSupport::Unsupported => false,
            ProtocolSupport::Unknown => {
                self.routing
                    .supports_protocol_with_refresh(
                        target,
                        PROTOCOL_BLOCK_SUBMISSION,
                        self.probe.as_ref(),
                    )
                    .await
            }
        }
    }

    async fn build_submission(
        &self,
        block: &Block,
        waived: &[PeerId],
        retry_attempt: u32,
        info: &SubmissionInfo,
    ) -> ConsensusResult<MinerBlockSubmission> {
        let parent_hash = self.election.parent_hash(block.header.height).await?;
        Ok(MinerBlockSubmission {
            base: MessageBase::new(rand::thread_rng().gen(), self.local),
            candidate_block: WireBlock::from(block),
            miner_peer_id: self.local,
            mining_difficulty: block.header.difficulty,
            parent_hash: *parent_hash.as_bytes(),
            relay_hop_limit: RELAY_HOP_LIMIT,
            waived_aggregators: waived.to_vec(),
            retry_attempt,
            original_miner_peer_id: info.original_miner_peer_id,
        })
    }
}
