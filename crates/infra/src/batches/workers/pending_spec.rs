//! Executes submitted batch specs and records the batch spec they produce.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use batchforge_batches::execution_log::{self, SOURCE_STEP_KEY};
use batchforge_batches::{PendingBatchSpec, SpecExecutor};

use crate::batches::store::BatchesTx;
use crate::jobs::{Handler, HandlerError, QueueRecord, Store};

/// Handler for pending batch specs.
///
/// Step output is appended to the record's execution log as it is
/// received, so it survives a failed attempt; the created batch spec is
/// then scraped from the full log.
pub struct PendingSpecHandler<S> {
    executor: Arc<dyn SpecExecutor>,
    queue: Arc<S>,
}

impl<S> PendingSpecHandler<S> {
    pub fn new(executor: Arc<dyn SpecExecutor>, queue: Arc<S>) -> Self {
        Self { executor, queue }
    }
}

#[async_trait]
impl<S, Tx> Handler<PendingBatchSpec, Tx> for PendingSpecHandler<S>
where
    S: Store<PendingBatchSpec>,
    Tx: BatchesTx,
{
    async fn handle(
        &self,
        tx: &mut Tx,
        record: &QueueRecord<PendingBatchSpec>,
    ) -> Result<(), HandlerError> {
        let entries = self.executor.execute(&record.payload).await?;

        let mut log = record.execution_logs.clone();
        for entry in entries {
            self.queue
                .add_execution_log_entry(record.id, &record.worker_hostname, &entry)
                .await?;
            log.push(entry);
        }

        let rand_id = match execution_log::batch_spec_id(&log, SOURCE_STEP_KEY) {
            Ok(id) => id,
            Err(e) => {
                warn!(record_id = record.id, error = %e, "execution produced no batch spec");
                return Err(HandlerError::retryable(e));
            }
        };
        tx.set_pending_batch_spec_result(record.id, &rand_id).await?;

        info!(record_id = record.id, batch_spec = %rand_id, "pending batch spec executed");
        Ok(())
    }
}
