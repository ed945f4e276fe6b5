//! Histogram implementation for duration tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram for tracking value distributions.
///
/// Values are recorded in seconds; the sum is kept in microsecond
/// resolution so sub-second observations do not vanish.
pub struct Histogram {
    /// Bucket boundaries (in seconds)
    buckets: Vec<f64>,
    /// Counts per bucket
    counts: Vec<AtomicU64>,
    /// Sum of all values, in microseconds
    sum_micros: AtomicU64,
    /// Total count
    count: AtomicU64,
}

impl Histogram {
    /// Create histogram with default buckets suited to RPC latencies
    pub fn new() -> Self {
        Self::with_buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ])
    }

    /// Create histogram with custom buckets
    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Histogram {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in seconds
    pub fn observe(&self, value: f64) {
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets
        if let Some(last) = self.counts.last() {
            last.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get mean value in seconds
    pub fn mean(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0 / count as f64
    }

    /// Get total count
    pub fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_mean() {
        let h = Histogram::new();
        h.observe(0.1);
        h.observe(0.3);
        assert_eq!(h.total_count(), 2);
        let mean = h.mean();
        assert!((mean - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_empty_mean() {
        let h = Histogram::new();
        assert_eq!(h.mean(), 0.0);
    }
}
