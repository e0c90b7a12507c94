//! Polling worker: claims records and runs a handler on each inside a
//! business transaction, heartbeating while the handler runs.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use batchforge_observability::{Counter, MetricsSink, NoopMetrics};

use super::store::{Store, StoreError};
use super::types::{QueueRecord, add_duration};

/// Source of the per-record transactions handlers write through.
#[async_trait]
pub trait Transact: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;
}

/// Error returned by a handler.
///
/// Retryable errors consume one unit of the record's retry budget;
/// non-retryable ones fail the record immediately. A transient `Store` error
/// puts the record back untouched: the storage layer failed, not the job.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(anyhow::Error),
    #[error("{0}")]
    NonRetryable(anyhow::Error),
    #[error(transparent)]
    Store(StoreError),
}

impl HandlerError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn non_retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::NonRetryable(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NonRetryable(_))
    }

    /// Whether the storage layer, not the handler's own logic, failed.
    pub fn is_transient_store_error(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(err)
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Domain work for one claimed record.
#[async_trait]
pub trait Handler<P, Tx>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
    Tx: Send + 'static,
{
    async fn handle(&self, tx: &mut Tx, record: &QueueRecord<P>) -> Result<(), HandlerError>;
}

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Worker configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Name for logging and metrics
    pub name: String,
    /// Number of concurrent poll loops
    pub num_handlers: usize,
    /// How long an idle poll loop sleeps before claiming again
    pub interval: Duration,
    /// How often a claimed record's heartbeat is refreshed
    pub heartbeat_interval: Duration,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            num_handlers: 1,
            interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_num_handlers(mut self, n: usize) -> Self {
        self.num_handlers = n.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Clamped to at least one millisecond.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Handle to stop running background tasks.
#[derive(Debug)]
pub struct RoutineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RoutineHandle {
    pub(crate) fn new(shutdown: watch::Sender<bool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, tasks }
    }

    /// Request graceful shutdown and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "background task panicked");
            }
        }
    }
}

/// Outcome of processing one claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Completed,
    Errored,
    Failed,
    /// Storage failed around the handler; the record went back to `queued`
    /// without spending its retry budget.
    Requeued,
    /// The record left `processing` while the handler ran; its result was dropped.
    Lost,
}

/// Polling worker over one queue.
pub struct Worker<P, S, T, H> {
    store: Arc<S>,
    transactor: Arc<T>,
    handler: Arc<H>,
    config: WorkerConfig,
    hostname: String,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S, T, H> Worker<P, S, T, H>
where
    P: Send + Sync + 'static,
    S: Store<P>,
    T: Transact,
    H: Handler<P, T::Tx>,
{
    pub fn new(store: Arc<S>, transactor: Arc<T>, handler: Arc<H>, config: WorkerConfig) -> Self {
        let hostname = format!("{}-{}", config.name, Uuid::now_v7());
        Self {
            store,
            transactor,
            handler,
            config,
            hostname,
            _payload: PhantomData,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Spawn `num_handlers` poll loops on the current tokio runtime.
    pub fn start(self) -> RoutineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Arc::new(self);

        let tasks = (0..worker.config.num_handlers.max(1))
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { worker.poll_loop(slot, shutdown).await })
            })
            .collect();

        RoutineHandle::new(shutdown_tx, tasks)
    }

    async fn poll_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, slot, "worker started");

        while !*shutdown.borrow() {
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    self.config
                        .metrics
                        .increment(&self.config.name, Counter::DequeueErrors, 1);
                    error!(worker = %self.config.name, error = %e, "failed to dequeue record");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(worker = %self.config.name, slot, "worker stopped");
    }

    /// Claim and process one record. `None` when the queue had nothing ready.
    ///
    /// Store errors while claiming are returned; everything after a
    /// successful claim is absorbed into the record's state.
    pub async fn process_next(&self) -> Result<Option<Processed>, StoreError> {
        let Some(record) = self.store.dequeue(&self.hostname).await? else {
            return Ok(None);
        };
        debug!(worker = %self.config.name, record_id = record.id, "claimed record");
        Ok(Some(self.process(record).await))
    }

    async fn process(&self, record: QueueRecord<P>) -> Processed {
        let id = record.id;
        let host = self.hostname.as_str();
        let result = self.handle_with_heartbeat(&record).await;
        if let Err(e) = &result {
            if e.is_transient_store_error() {
                return self.requeue(id, e).await;
            }
        }

        let (outcome, marked) = match &result {
            Ok(()) => (Processed::Completed, self.store.mark_complete(id, host).await),
            Err(e) if e.is_retryable() => {
                let marked = self.store.mark_errored(id, host, &e.to_string()).await;
                (Processed::Errored, marked)
            }
            Err(e) => {
                let marked = self.store.mark_failed(id, host, &e.to_string()).await;
                (Processed::Failed, marked)
            }
        };

        let metrics = &self.config.metrics;
        let scope = &self.config.name;
        metrics.increment(scope, Counter::Handled, 1);
        match &result {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                metrics.increment(scope, Counter::HandlerErrors, 1);
                warn!(worker = %scope, record_id = id, error = %e, "handler failed");
            }
            Err(e) => {
                metrics.increment(scope, Counter::NonRetryableErrors, 1);
                warn!(worker = %scope, record_id = id, error = %e, "handler failed permanently");
            }
        }

        match marked {
            Ok(true) => outcome,
            Ok(false) => {
                warn!(worker = %scope, record_id = id, "record no longer held, result dropped");
                Processed::Lost
            }
            Err(e) => {
                // The resetter will pick the record up once its heartbeat goes stale.
                error!(
                    worker = %scope,
                    record_id = id,
                    error = %e,
                    "failed to record handler outcome"
                );
                Processed::Lost
            }
        }
    }

    /// Hand the record back for the next poll without touching its budgets.
    async fn requeue(&self, id: i64, cause: &HandlerError) -> Processed {
        let scope = &self.config.name;
        self.config.metrics.increment(scope, Counter::Errors, 1);
        warn!(
            worker = %scope,
            record_id = id,
            error = %cause,
            "storage error while handling record, requeueing"
        );

        let after = add_duration(chrono::Utc::now(), self.config.interval);
        match self.store.requeue(id, &self.hostname, after).await {
            Ok(()) => Processed::Requeued,
            Err(e) => {
                // The resetter will pick the record up once its heartbeat goes stale.
                error!(worker = %scope, record_id = id, error = %e, "failed to requeue record");
                Processed::Lost
            }
        }
    }

    /// Run the handler in a transaction while a heartbeat ticker keeps the claim alive.
    async fn handle_with_heartbeat(&self, record: &QueueRecord<P>) -> Result<(), HandlerError> {
        let handled = self.handle_in_tx(record);
        tokio::pin!(handled);

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut handled => return result,
                _ = ticker.tick() => self.heartbeat(record.id).await,
            }
        }
    }

    async fn heartbeat(&self, id: i64) {
        let scope = &self.config.name;
        match self.store.heartbeat(&[id], &self.hostname).await {
            Ok(known) if known.contains(&id) => {}
            Ok(_) => warn!(worker = %scope, record_id = id, "heartbeat for record no longer held"),
            Err(e) => warn!(worker = %scope, record_id = id, error = %e, "heartbeat failed"),
        }
    }

    async fn handle_in_tx(&self, record: &QueueRecord<P>) -> Result<(), HandlerError> {
        let mut tx = self.transactor.begin().await?;

        match self.handler.handle(&mut tx, record).await {
            Ok(()) => {
                self.transactor.commit(tx).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = self.transactor.rollback(tx).await {
                    warn!(
                        worker = %self.config.name,
                        record_id = record.id,
                        error = %rb,
                        "rollback failed"
                    );
                }
                Err(e)
            }
        }
    }
}
