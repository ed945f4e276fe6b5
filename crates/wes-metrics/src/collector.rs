//! Metrics collector implementation

use crate::Histogram;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Thread-safe metrics storage.
///
/// Passed around as `Arc<Metrics>`; there is no global registry.
pub struct Metrics {
    /// Histogram metrics for duration tracking
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    /// Counter metrics for event counting
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    /// Labeled counters, keyed by (name, label value)
    labeled_counters: RwLock<HashMap<(String, String), Arc<AtomicU64>>>,
    /// Gauge metrics for current values
    gauges: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl Metrics {
    /// Create a new metrics store
    pub fn new() -> Self {
        Self {
            histograms: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            labeled_counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// Record a histogram observation (seconds)
    pub fn histogram(&self, name: &str, value: f64) {
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(name) {
            h.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.histograms.write();
        let h = histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()));
        h.observe(value);
    }

    /// Increment a counter
    pub fn counter(&self, name: &str, delta: u64) {
        let counters = self.counters.read();
        if let Some(c) = counters.get(name) {
            c.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write();
        let c = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        c.fetch_add(delta, Ordering::Relaxed);
    }

    /// Increment a labeled counter, e.g. `waiver_total{reason}`
    pub fn counter_labeled(&self, name: &str, label: &str, delta: u64) {
        let counters = self.labeled_counters.read();
        if let Some(c) = counters.get(&(name.to_string(), label.to_string())) {
            c.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.labeled_counters.write();
        let c = counters
            .entry((name.to_string(), label.to_string()))
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        c.fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a gauge value
    pub fn gauge(&self, name: &str, value: i64) {
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(name) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);

        let mut gauges = self.gauges.write();
        let g = gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));
        g.store(value, Ordering::Relaxed);
    }

    /// Get histogram mean for a metric
    pub fn get_histogram_mean(&self, name: &str) -> Option<f64> {
        self.histograms.read().get(name).map(|h| h.mean())
    }

    /// Get counter value
    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Get labeled counter value
    pub fn get_counter_labeled(&self, name: &str, label: &str) -> Option<u64> {
        self.labeled_counters
            .read()
            .get(&(name.to_string(), label.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Get gauge value
    pub fn get_gauge(&self, name: &str) -> Option<i64> {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
    }

    /// Get all counter names and values
    pub fn all_counters(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        out.extend(
            self.labeled_counters
                .read()
                .iter()
                .map(|((name, label), v)| {
                    (format!("{}{{{}}}", name, label), v.load(Ordering::Relaxed))
                }),
        );
        out
    }

    /// Get all gauge names and values
    pub fn all_gauges(&self) -> Vec<(String, i64)> {
        self.gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Get all histogram names, means and counts
    pub fn all_histograms(&self) -> Vec<(String, f64, u64)> {
        self.histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.mean(), v.total_count()))
            .collect()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
