//! Batch-changes handlers and their wiring onto the queue engine.

pub mod bulk_processor;
pub mod pending_spec;
pub mod reconciler;
pub mod workspace_creator;

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use batchforge_batches::{
    BatchSpecResolutionJob, Changeset, ChangesetJob, ChangesetSource, PendingBatchSpec, Reconciler,
    SpecExecutor, WorkspaceResolver,
};
use batchforge_observability::MetricsSink;

pub use bulk_processor::BulkProcessor;
pub use pending_spec::PendingSpecHandler;
pub use reconciler::ReconcilerHandler;
pub use workspace_creator::WorkspaceCreator;

use super::queues;
use crate::config::Settings;
use crate::jobs::{
    Handler, PgPayload, PostgresStore, PostgresTransactor, QueueOptions, Resetter, ResetterConfig,
    RoutineHandle, Store, Worker, WorkerConfig,
};

/// External collaborators the handlers delegate to.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn WorkspaceResolver>,
    pub source: Arc<dyn ChangesetSource>,
    pub reconciler: Arc<dyn Reconciler>,
    pub executor: Arc<dyn SpecExecutor>,
}

/// Every batch-changes worker and resetter running against one pool.
pub struct BatchesWorkers {
    routines: Vec<(String, RoutineHandle)>,
}

impl BatchesWorkers {
    /// Start all workers and resetters on the current tokio runtime.
    pub fn start(
        pool: Arc<PgPool>,
        settings: &Settings,
        collaborators: Collaborators,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let transactor = Arc::new(PostgresTransactor::new(Arc::clone(&pool)));
        let mut wiring = Wiring {
            pool,
            transactor,
            settings,
            metrics,
            routines: Vec::new(),
        };

        wiring.queue::<BatchSpecResolutionJob, _>(
            queues::resolution_jobs(),
            WorkspaceCreator::new(collaborators.resolver),
        );
        wiring.queue::<ChangesetJob, _>(
            queues::changeset_jobs(),
            BulkProcessor::new(collaborators.source),
        );
        wiring.queue::<Changeset, _>(
            queues::reconciler(),
            ReconcilerHandler::new(collaborators.reconciler),
        );

        let pending = Arc::new(PostgresStore::<PendingBatchSpec>::new(
            Arc::clone(&wiring.pool),
            queues::pending_batch_specs(),
        ));
        let handler = PendingSpecHandler::new(collaborators.executor, Arc::clone(&pending));
        wiring.start(pending, handler);

        info!(routines = wiring.routines.len(), "batch changes workers started");
        Self {
            routines: wiring.routines,
        }
    }

    /// Names of the running routines, in start order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routines.iter().map(|(name, _)| name.as_str())
    }

    /// Stop every routine, waiting for in-flight records to finish.
    pub async fn shutdown(self) {
        for (name, routine) in self.routines {
            routine.shutdown().await;
            info!(routine = %name, "stopped");
        }
    }
}

struct Wiring<'a> {
    pool: Arc<PgPool>,
    transactor: Arc<PostgresTransactor>,
    settings: &'a Settings,
    metrics: Arc<dyn MetricsSink>,
    routines: Vec<(String, RoutineHandle)>,
}

impl Wiring<'_> {
    fn queue<P, H>(&mut self, options: QueueOptions, handler: H)
    where
        P: PgPayload,
        H: Handler<P, Transaction<'static, Postgres>>,
    {
        let store = Arc::new(PostgresStore::new(Arc::clone(&self.pool), options));
        self.start(store, handler);
    }

    fn start<P, H>(&mut self, store: Arc<PostgresStore<P>>, handler: H)
    where
        P: PgPayload,
        H: Handler<P, Transaction<'static, Postgres>>,
    {
        let name = store.options().name.clone();

        let worker = Worker::new(
            Arc::clone(&store),
            Arc::clone(&self.transactor),
            Arc::new(handler),
            WorkerConfig::default()
                .with_name(name.clone())
                .with_num_handlers(self.settings.worker_num_handlers)
                .with_interval(self.settings.worker_poll_interval)
                .with_heartbeat_interval(self.settings.worker_heartbeat_interval)
                .with_metrics(Arc::clone(&self.metrics)),
        );
        self.routines.push((name.clone(), worker.start()));

        let resetter_name = format!("{name}_resetter");
        let resetter = Resetter::new(
            store,
            ResetterConfig::default()
                .with_name(resetter_name.clone())
                .with_interval(self.settings.resetter_interval)
                .with_metrics(Arc::clone(&self.metrics)),
        );
        self.routines.push((resetter_name, resetter.start()));
    }
}
