//! Applies one bulk operation to one changeset.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use batchforge_batches::{BulkOperation, ChangesetJob, ChangesetSource, ReconcilerState};

use crate::batches::store::BatchesTx;
use crate::jobs::{Handler, HandlerError, QueueRecord};

/// Handler for changeset jobs.
///
/// Jobs with an unknown type or an undecodable payload fail permanently
/// before anything is read or written.
pub struct BulkProcessor {
    source: Arc<dyn ChangesetSource>,
}

impl BulkProcessor {
    pub fn new(source: Arc<dyn ChangesetSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<Tx: BatchesTx> Handler<ChangesetJob, Tx> for BulkProcessor {
    async fn handle(
        &self,
        tx: &mut Tx,
        record: &QueueRecord<ChangesetJob>,
    ) -> Result<(), HandlerError> {
        let job = &record.payload;
        let operation = job.operation().map_err(HandlerError::non_retryable)?;
        let mut changeset = tx.get_changeset(job.changeset_id).await?;

        match operation {
            BulkOperation::Comment { message } => {
                self.source
                    .create_comment(job.user_id, &changeset, &message)
                    .await?;
            }
            BulkOperation::Merge { squash } => {
                self.source
                    .merge_changeset(job.user_id, &changeset, squash)
                    .await?;
            }
            BulkOperation::Detach => {
                if !changeset.detach(job.batch_change_id) {
                    debug!(
                        changeset_id = %changeset.id,
                        batch_change_id = %job.batch_change_id,
                        "changeset not attached, nothing to detach"
                    );
                    return Ok(());
                }
                changeset.reset_reconciler_state(ReconcilerState::Queued);
                tx.update_changeset(&changeset).await?;
            }
            BulkOperation::Reenqueue => {
                if changeset.reconciler_state != ReconcilerState::Failed {
                    debug!(
                        changeset_id = %changeset.id,
                        state = %changeset.reconciler_state,
                        "changeset not failed, skipping reenqueue"
                    );
                    return Ok(());
                }
                changeset.reset_reconciler_state(ReconcilerState::Queued);
                tx.update_changeset(&changeset).await?;
            }
        }

        info!(
            record_id = record.id,
            bulk_group = %job.bulk_group,
            changeset_id = %job.changeset_id,
            job_type = %job.job_type,
            "processed bulk operation"
        );
        Ok(())
    }
}
