//! Metrics capability injected into the queue engine.
//!
//! The engine never touches a process-wide registry. Workers and resetters
//! receive an `Arc<dyn MetricsSink>` at construction and report counters
//! through it; the embedding process decides where those counters go.

use std::collections::HashMap;
use std::sync::Mutex;

/// Counters emitted by the queue engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Counter {
    /// A worker claimed a record and ran its handler.
    Handled,
    /// A handler failed and the record was sent back for retry (or failed).
    HandlerErrors,
    /// A record was moved straight to `failed` by a non-retryable error.
    NonRetryableErrors,
    /// A worker poll hit a storage error.
    DequeueErrors,
    /// The resetter moved stalled records back to `queued`.
    Resets,
    /// The resetter escalated stalled records to terminal `errored`.
    ResetFailures,
    /// Storage failed under a worker's handler or during a resetter scan.
    Errors,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Handled => "handled",
            Counter::HandlerErrors => "handler_errors",
            Counter::NonRetryableErrors => "non_retryable_errors",
            Counter::DequeueErrors => "dequeue_errors",
            Counter::Resets => "resets",
            Counter::ResetFailures => "reset_failures",
            Counter::Errors => "errors",
        }
    }
}

/// Sink for engine counters.
///
/// `scope` is the name of the emitting worker or resetter.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment(&self, scope: &str, counter: Counter, by: u64);
}

/// Discards everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _scope: &str, _counter: Counter, _by: u64) {}
}

/// Emits every increment as a `tracing` event at debug level.
#[derive(Debug, Default, Copy, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, scope: &str, counter: Counter, by: u64) {
        ::tracing::debug!(scope, counter = counter.as_str(), by, "metric");
    }
}

/// Keeps running totals in memory (tests/dev and scrape-based exporters).
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<HashMap<(String, Counter), u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current total for `scope`/`counter` (0 if never incremented).
    pub fn get(&self, scope: &str, counter: Counter) -> u64 {
        match self.inner.lock() {
            Ok(map) => map.get(&(scope.to_string(), counter)).copied().unwrap_or(0),
            Err(poisoned) => poisoned
                .into_inner()
                .get(&(scope.to_string(), counter))
                .copied()
                .unwrap_or(0),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, scope: &str, counter: Counter, by: u64) {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        *map.entry((scope.to_string(), counter)).or_insert(0) += by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_metrics_accumulate_per_scope() {
        let metrics = InMemoryMetrics::new();
        metrics.increment("a", Counter::Resets, 2);
        metrics.increment("a", Counter::Resets, 3);
        metrics.increment("b", Counter::Resets, 1);

        assert_eq!(metrics.get("a", Counter::Resets), 5);
        assert_eq!(metrics.get("b", Counter::Resets), 1);
        assert_eq!(metrics.get("a", Counter::Errors), 0);
    }

    #[test]
    fn counter_names_are_stable() {
        assert_eq!(Counter::ResetFailures.as_str(), "reset_failures");
        assert_eq!(Counter::Errors.as_str(), "errors");
    }
}
