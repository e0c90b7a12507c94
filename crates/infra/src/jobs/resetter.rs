//! Periodic recovery of records whose worker stopped heartbeating.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use batchforge_observability::{Counter, MetricsSink, NoopMetrics};

use super::store::{Store, StoreError};
use super::types::ResetOutcome;
use super::worker::RoutineHandle;

/// Resetter configuration.
#[derive(Clone)]
pub struct ResetterConfig {
    pub name: String,
    /// Pause between scans
    pub interval: Duration,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for ResetterConfig {
    fn default() -> Self {
        Self {
            name: "resetter".to_string(),
            interval: Duration::from_secs(60),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl ResetterConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Requeues stalled records, escalating those out of reset budget.
///
/// Safe to run in several processes at once: a reset record no longer
/// matches the stall predicate, so a second pass leaves it alone.
pub struct Resetter<P, S> {
    store: Arc<S>,
    config: ResetterConfig,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S> Resetter<P, S>
where
    P: Send + Sync + 'static,
    S: Store<P>,
{
    pub fn new(store: Arc<S>, config: ResetterConfig) -> Self {
        Self {
            store,
            config,
            _payload: PhantomData,
        }
    }

    pub fn start(self) -> RoutineHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let resetter = self;

        let task = tokio::spawn(async move {
            info!(resetter = %resetter.config.name, "resetter started");
            while !*shutdown.borrow() {
                let _ = resetter.reset_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(resetter.config.interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            info!(resetter = %resetter.config.name, "resetter stopped");
        });

        RoutineHandle::new(shutdown_tx, vec![task])
    }

    /// One scan. Outcomes and errors are logged and counted here.
    pub async fn reset_once(&self) -> Result<ResetOutcome, StoreError> {
        let scope = &self.config.name;
        let metrics = &self.config.metrics;

        let outcome = match self.store.reset_stalled().await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics.increment(scope, Counter::Errors, 1);
                error!(resetter = %scope, error = %e, "failed to reset stalled records");
                return Err(e);
            }
        };

        for (id, age) in &outcome.reset {
            warn!(resetter = %scope, record_id = id, heartbeat_age = ?age, "reset stalled record");
        }
        for (id, age) in &outcome.escalated {
            warn!(
                resetter = %scope,
                record_id = id,
                heartbeat_age = ?age,
                "stalled record exceeded reset budget"
            );
        }
        metrics.increment(scope, Counter::Resets, outcome.reset.len() as u64);
        metrics.increment(scope, Counter::ResetFailures, outcome.escalated.len() as u64);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::MockClock;
    use crate::jobs::store::InMemoryStore;
    use crate::jobs::types::{QueueOptions, QueueRecord, RecordState};
    use batchforge_observability::InMemoryMetrics;

    #[tokio::test]
    async fn counts_resets_and_escalations() {
        let clock = Arc::new(MockClock::default());
        let options = QueueOptions::new("test", "test_jobs")
            .with_stalled_max_age(Duration::from_secs(5))
            .with_max_num_resets(1);
        let store = Arc::new(InMemoryStore::with_clock(options, clock.clone()));

        let mut spent = QueueRecord::queued(2, ());
        spent.num_resets = 1;
        store.enqueue(QueueRecord::queued(1, ())).unwrap();
        store.enqueue(spent).unwrap();
        store.dequeue("w").await.unwrap();
        store.dequeue("w").await.unwrap();
        clock.advance(Duration::from_secs(6));

        let metrics = Arc::new(InMemoryMetrics::default());
        let resetter = Resetter::new(
            store.clone(),
            ResetterConfig::default().with_name("test-resetter").with_metrics(metrics.clone()),
        );

        let outcome = resetter.reset_once().await.unwrap();
        assert_eq!(outcome.reset.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(outcome.escalated.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.get(2).unwrap().unwrap().state, RecordState::Errored);
        assert_eq!(metrics.get("test-resetter", Counter::Resets), 1);
        assert_eq!(metrics.get("test-resetter", Counter::ResetFailures), 1);

        assert!(resetter.reset_once().await.unwrap().is_empty());
        assert_eq!(metrics.get("test-resetter", Counter::Resets), 1);
    }

    #[tokio::test]
    async fn started_resetter_shuts_down() {
        let store = Arc::new(InMemoryStore::<()>::new(QueueOptions::new("test", "test_jobs")));
        let config = ResetterConfig::default().with_interval(Duration::from_millis(5));
        let handle = Resetter::new(store, config).start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;
    }
}
