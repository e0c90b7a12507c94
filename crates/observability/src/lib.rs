//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging) with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Counters injected into workers and resetters.
pub mod metrics;

pub use metrics::{Counter, InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use self::tracing::{LogFormat, init_with};
