//! Metrics export and snapshot functionality

use crate::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of all metrics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Counter values (labeled counters render as `name{label}`)
    pub counters: HashMap<String, u64>,
    /// Gauge values
    pub gauges: HashMap<String, i64>,
    /// Histogram summaries (mean, count)
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Summary of a histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Mean value in seconds
    pub mean: f64,
    /// Total observation count
    pub count: u64,
}

impl MetricsSnapshot {
    /// Create a snapshot from a Metrics instance
    pub fn from_metrics(metrics: &Metrics) -> Self {
        let counters = metrics.all_counters().into_iter().collect();
        let gauges = metrics.all_gauges().into_iter().collect();
        let histograms = metrics
            .all_histograms()
            .into_iter()
            .map(|(name, mean, count)| (name, HistogramSummary { mean, count }))
            .collect();

        Self {
            counters,
            gauges,
            histograms,
        }
    }

    /// Export snapshot as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_json() {
        let metrics = Metrics::new();
        metrics.counter("parent_hash_requests_total", 4);
        metrics.counter_labeled("waiver_total", "height_too_far_ahead", 1);
        metrics.gauge("current_timeout_seconds", 15);

        let snapshot = MetricsSnapshot::from_metrics(&metrics);
        let json = snapshot.to_json().unwrap();

        assert!(json.contains("parent_hash_requests_total"));
        assert!(json.contains("waiver_total{height_too_far_ahead}"));
        assert!(json.contains("current_timeout_seconds"));
    }
}
