//! # wes-metrics
//!
//! Observability and metrics collection for WeiSyn.
//!
//! Features:
//! - Histogram for latency tracking
//! - Counter for event counting, with optional labels
//! - Gauge for current values
//! - JSON export

#![warn(missing_docs)]
#![warn(clippy::all)]

mod collector;
mod export;
mod histogram;

pub use collector::Metrics;
pub use export::{HistogramSummary, MetricsSnapshot};
pub use histogram::Histogram;

/// Macro for timing a block of code
#[macro_export]
macro_rules! timed {
    ($metrics:expr, $name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        $metrics.histogram($name, start.elapsed().as_secs_f64());
        result
    }};
}
