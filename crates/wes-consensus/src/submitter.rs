//! Submitter-side confirmation of a forwarded candidate
//!
//! After an `accepted && !waived` ack the miner first listens for the
//! result broadcast, then falls back to polling the aggregator's status,
//! and re-submits through the router when the aggregator turns out to be
//! gone or never elected.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wes_network::message::{
    decode_payload, encode_payload, AggregationPhase, AggregatorStatusQuery,
    AggregatorStatusResponse, MessageBase, PROTOCOL_AGGREGATOR_STATUS,
};
use wes_network::{PeerId, Transport};
use wes_primitives::H256;
use wes_types::Block;

use crate::config::AggregationConfig;
use crate::error::{ConsensusError, ConsensusResult};
use crate::forward::SubmissionRouter;
use crate::traits::ChainQuery;
use crate::types::{RoundOutcome, SubmissionInfo};

/// Note delivered to waiting submitters when a result broadcast arrives.
#[derive(Debug, Clone)]
pub struct ResultNotice {
    /// Committed height
    pub height: u64,
    /// Hash of the committed block
    pub block_hash: H256,
}

/// How a submission ended up confirmed.
#[derive(Debug, Clone)]
pub enum ConfirmationOutcome {
    /// The result broadcast for the height arrived
    Broadcast {
        /// Committed block hash from the broadcast
        block_hash: H256,
    },
    /// A status poll reported the height completed
    StatusConfirmed,
    /// The local chain already carries the height (the broadcast was
    /// applied before the submitter started waiting)
    LocalChain,
    /// The submission was re-routed; the new outcome is attached
    Resubmitted {
        /// Outcome of the re-routed submission
        outcome: RoundOutcome,
    },
}

/// Wait-then-poll reconciliation for forwarded candidates.
pub struct SubmitterClient {
    local: PeerId,
    transport: Arc<dyn Transport>,
    router: Arc<SubmissionRouter>,
    chain: Arc<dyn ChainQuery>,
    config: Arc<AggregationConfig>,
    results: broadcast::Sender<ResultNotice>,
    last_resubmit: Mutex<Option<Instant>>,
}

impl SubmitterClient {
    /// Creates the client; the node feeds broadcasts in via
    /// [`SubmitterClient::notify_result`].
    pub fn new(
        transport: Arc<dyn Transport>,
        router: Arc<SubmissionRouter>,
        chain: Arc<dyn ChainQuery>,
        config: Arc<AggregationConfig>,
    ) -> Self {
        let (results, _) = broadcast::channel(64);
        Self {
            local: transport.local_peer_id(),
            transport,
            router,
            chain,
            config,
            results,
            last_resubmit: Mutex::new(None),
        }
    }

    /// Whether the local chain already carries the height.
    async fn committed_locally(&self, height: u64) -> bool {
        self.chain
            .info()
            .await
            .map(|info| info.height >= height)
            .unwrap_or(false)
    }

    /// Delivers an incoming result broadcast to any waiting submitter.
    pub fn notify_result(&self, notice: ResultNotice) {
        // Zero receivers just means nobody is waiting right now.
        let _ = self.results.send(notice);
    }

    /// Waits for the committed result of `block`'s height.
    ///
    /// Phase 1 listens for the topic broadcast for the full expected
    /// aggregation span; phase 2 polls the aggregator's status, and
    /// re-submits with an augmented waiver set when the aggregator is
    /// offline or reports `NotAggregator`.
    pub async fn await_confirmation(
        &self,
        block: &Block,
        aggregator: PeerId,
        info: &SubmissionInfo,
        cancel: &CancellationToken,
    ) -> ConsensusResult<ConfirmationOutcome> {
        let height = block.header.height;

        // The broadcast can race ahead of the acceptance ack; if the
        // height is already on the local chain there is nothing to wait
        // for.
        if self.committed_locally(height).await {
            return Ok(ConfirmationOutcome::LocalChain);
        }

        let wait = self.config.collection_window
            + self.config.distribution_timeout
            + self.config.network_buffer;

        if let Some(hash) = self.listen_for_broadcast(height, wait, cancel).await? {
            return Ok(ConfirmationOutcome::Broadcast { block_hash: hash });
        }
        if self.committed_locally(height).await {
            return Ok(ConfirmationOutcome::LocalChain);
        }

        debug!(height, "no broadcast within window, polling aggregator status");
        self.poll_status(block, aggregator, info, cancel).await
    }

    /// Phase 1: broadcast subscription filtered by height.
    async fn listen_for_broadcast(
        &self,
        height: u64,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> ConsensusResult<Option<H256>> {
        let mut rx = self.results.subscribe();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                notice = rx.recv() => match notice {
                    Ok(notice) if notice.height == height => {
                        info!(height, hash = %notice.block_hash.short_hex(), "confirmed by broadcast");
                        return Ok(Some(notice.block_hash));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(height, skipped, "result channel lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
                _ = &mut deadline => return Ok(None),
                _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            }
        }
    }

    /// Phase 2: bounded status polling with re-submission fallback.
    async fn poll_status(
        &self,
        block: &Block,
        aggregator: PeerId,
        info: &SubmissionInfo,
        cancel: &CancellationToken,
    ) -> ConsensusResult<ConfirmationOutcome> {
        let height = block.header.height;
        let poll_deadline = Instant::now() + self.config.query_total_timeout;

        for attempt in 0..self.config.max_query_attempts {
            if cancel.is_cancelled() {
                return Err(ConsensusError::Cancelled);
            }
            if Instant::now() >= poll_deadline {
                break;
            }

            let query = AggregatorStatusQuery {
                base: MessageBase::new(rand::thread_rng().gen(), self.local),
                height,
            };
            let payload = Bytes::from(encode_payload(&query)?);
            let call = self
                .transport
                .call(aggregator, PROTOCOL_AGGREGATOR_STATUS, payload);

            let response = tokio::select! {
                result = tokio::time::timeout(self.config.call_timeout, call) => result,
                _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            };

            match response {
                Ok(Ok(bytes)) => {
                    let status: AggregatorStatusResponse = decode_payload(&bytes)?;
                    match status.state {
                        AggregationPhase::Completed => {
                            info!(height, "confirmed by status query");
                            return Ok(ConfirmationOutcome::StatusConfirmed);
                        }
                        AggregationPhase::NotAggregator => {
                            warn!(
                                height,
                                aggregator = %aggregator.short_hex(),
                                "queried peer is not the aggregator, re-submitting"
                            );
                            return self.resubmit(block, aggregator, info, cancel).await;
                        }
                        AggregationPhase::Collecting
                        | AggregationPhase::Evaluating
                        | AggregationPhase::Distributing
                        | AggregationPhase::Unknown => {
                            debug!(height, attempt, state = ?status.state, "aggregation in progress");
                        }
                    }
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(
                        height,
                        aggregator = %aggregator.short_hex(),
                        error = %e,
                        "aggregator unreachable, re-submitting"
                    );
                    return self.resubmit(block, aggregator, info, cancel).await;
                }
                Ok(Err(e)) => return Err(ConsensusError::Transport(e)),
                Err(_) => {
                    warn!(
                        height,
                        aggregator = %aggregator.short_hex(),
                        "status query timed out, re-submitting"
                    );
                    return self.resubmit(block, aggregator, info, cancel).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.query_retry_interval) => {}
                _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            }
        }

        Err(ConsensusError::ConfirmationTimeout { height })
    }

    /// Re-routes the candidate with the failed aggregator waived, spaced
    /// by the resubmit throttle.
    async fn resubmit(
        &self,
        block: &Block,
        failed_aggregator: PeerId,
        info: &SubmissionInfo,
        cancel: &CancellationToken,
    ) -> ConsensusResult<ConfirmationOutcome> {
        let min_interval = self.config.confirmation_resubmit_min_interval;
        let pause = {
            let last = self.last_resubmit.lock();
            last.map(|at| min_interval.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        if !pause.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            }
        }
        *self.last_resubmit.lock() = Some(Instant::now());

        let mut next = info.clone();
        next.waived_aggregators.push(failed_aggregator);
        next.retry_attempt += 1;

        let outcome = self
            .router
            .forward_block(block.clone(), next, cancel)
            .await?;
        Ok(ConfirmationOutcome::Resubmitted { outcome })
    }
}
