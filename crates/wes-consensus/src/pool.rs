//! Per-height candidate collection windows
//!
//! Window lifecycle: candidates may stage before the window is started;
//! `start_collection_window` arms the timer; `close_collection_window`
//! waits out the timer, drains the pool and destroys the window. A second
//! close returns empty.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wes_network::PeerId;
use wes_primitives::H256;
use wes_types::Block;

use crate::error::{ConsensusError, ConsensusResult};
use crate::traits::BlockHashService;
use crate::types::{CandidateBlock, CollectionProgress};

struct Window {
    opened_at: Instant,
    /// Armed by `start_collection_window`; `None` while staging
    closes_at: Option<Instant>,
    pool: HashMap<H256, CandidateBlock>,
}

impl Window {
    fn new() -> Self {
        Self {
            opened_at: Instant::now(),
            closes_at: None,
            pool: HashMap::new(),
        }
    }
}

/// Fixed-duration candidate collection, one window per height.
pub struct CandidatePool {
    hasher: Arc<dyn BlockHashService>,
    windows: Mutex<HashMap<u64, Window>>,
}

impl CandidatePool {
    /// Creates a pool hashing candidates through the given service.
    pub fn new(hasher: Arc<dyn BlockHashService>) -> Self {
        Self {
            hasher,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a candidate, deduplicating by block hash. Arrivals after the
    /// window deadline are dropped. Returns the block hash either way.
    pub fn add_candidate(
        &self,
        block: Block,
        source_peer: Option<PeerId>,
    ) -> ConsensusResult<H256> {
        if block.body.transactions.is_empty() {
            return Err(ConsensusError::InvalidCandidate(
                "candidate body carries no transactions".to_string(),
            ));
        }
        let block_hash = self.hasher.compute(&block)?;
        if block_hash.is_zero() {
            return Err(ConsensusError::InvalidCandidate(
                "candidate hashes to zero".to_string(),
            ));
        }

        let height = block.header.height;
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(height).or_insert_with(Window::new);

        if let Some(closes_at) = window.closes_at {
            if now > closes_at {
                debug!(
                    height,
                    hash = %block_hash.short_hex(),
                    "late candidate dropped, window already closed"
                );
                return Ok(block_hash);
            }
        }

        if window.pool.contains_key(&block_hash) {
            debug!(height, hash = %block_hash.short_hex(), "duplicate candidate ignored");
            return Ok(block_hash);
        }

        window
            .pool
            .insert(block_hash, CandidateBlock::new(block, block_hash, source_peer));
        debug!(
            height,
            hash = %block_hash.short_hex(),
            total = window.pool.len(),
            "candidate collected"
        );
        Ok(block_hash)
    }

    /// Arms (or re-arms) the collection timer for a height. Candidates
    /// staged before this call survive.
    pub fn start_collection_window(&self, height: u64, duration: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(height).or_insert_with(Window::new);
        window.opened_at = now;
        window.closes_at = Some(now + duration);
        debug!(height, secs = duration.as_secs_f64(), "collection window started");
    }

    /// Waits until the window deadline, then drains and destroys the
    /// window. Idempotent: with no window present, returns empty.
    pub async fn close_collection_window(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> ConsensusResult<Vec<CandidateBlock>> {
        let deadline = {
            let windows = self.windows.lock();
            match windows.get(&height) {
                Some(window) => window.closes_at,
                None => return Ok(Vec::new()),
            }
        };

        if let Some(deadline) = deadline {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancel.cancelled() => {
                    self.drop_window(height);
                    return Err(ConsensusError::Cancelled);
                }
            }
        }

        let mut windows = self.windows.lock();
        let Some(window) = windows.remove(&height) else {
            return Ok(Vec::new());
        };
        let candidates: Vec<CandidateBlock> = window.pool.into_values().collect();
        debug!(height, count = candidates.len(), "collection window closed");
        Ok(candidates)
    }

    /// Discards a window and everything collected in it.
    pub fn drop_window(&self, height: u64) {
        if self.windows.lock().remove(&height).is_some() {
            debug!(height, "collection window dropped");
        }
    }

    /// Whether a timed window for this height is still open.
    pub fn is_collection_active(&self, height: u64) -> bool {
        let windows = self.windows.lock();
        windows
            .get(&height)
            .and_then(|w| w.closes_at)
            .map(|closes_at| Instant::now() < closes_at)
            .unwrap_or(false)
    }

    /// Candidate count and remaining time for an open window.
    pub fn get_collection_progress(&self, height: u64) -> Option<CollectionProgress> {
        let windows = self.windows.lock();
        let window = windows.get(&height)?;
        let remaining = window
            .closes_at
            .map(|closes_at| closes_at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);
        Some(CollectionProgress {
            candidate_count: window.pool.len(),
            remaining,
        })
    }

    /// Candidate count for an open window, if any.
    pub fn candidate_count(&self, height: u64) -> Option<usize> {
        self.windows.lock().get(&height).map(|w| w.pool.len())
    }

    /// Unix-milliseconds deadline of the open window, for status queries.
    pub fn window_end_unix_ms(&self, height: u64) -> Option<u64> {
        let windows = self.windows.lock();
        let closes_at = windows.get(&height)?.closes_at?;
        let remaining = closes_at.saturating_duration_since(Instant::now());
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Some(now_ms + remaining.as_millis() as u64)
    }
}
