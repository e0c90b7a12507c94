//! Hands queued changesets to the reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use batchforge_batches::{Changeset, Reconciler};

use crate::jobs::{Handler, HandlerError, QueueRecord};

/// Handler for the changeset reconciler queue.
///
/// The reconciler owns all code-host effects; its errors spend the
/// changeset's retry budget.
pub struct ReconcilerHandler {
    reconciler: Arc<dyn Reconciler>,
}

impl ReconcilerHandler {
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl<Tx: Send + 'static> Handler<Changeset, Tx> for ReconcilerHandler {
    async fn handle(
        &self,
        _tx: &mut Tx,
        record: &QueueRecord<Changeset>,
    ) -> Result<(), HandlerError> {
        let changeset = &record.payload;
        debug!(changeset_id = %changeset.id, repo_id = %changeset.repo_id, "reconciling changeset");
        self.reconciler.reconcile(changeset).await?;
        Ok(())
    }
}
