//! External collaborators the batch-changes workers drive.
//!
//! Code-host access, the changeset reconciler and the out-of-process batch
//! tooling all live outside this crate; workers receive them as trait objects.

use async_trait::async_trait;

use batchforge_core::{ExecutionLogEntry, UserId};

use crate::batch_spec::PendingBatchSpec;
use crate::changeset::Changeset;

/// Access to the code host holding a changeset, acting as `actor`.
#[async_trait]
pub trait ChangesetSource: Send + Sync + 'static {
    async fn create_comment(
        &self,
        actor: UserId,
        changeset: &Changeset,
        body: &str,
    ) -> anyhow::Result<()>;

    async fn merge_changeset(
        &self,
        actor: UserId,
        changeset: &Changeset,
        squash: bool,
    ) -> anyhow::Result<()>;
}

/// Drives one changeset towards its desired state on the code host.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, changeset: &Changeset) -> anyhow::Result<()>;
}

/// Runs the batch tooling against a submitted spec and returns the captured
/// output of each step, in order.
#[async_trait]
pub trait SpecExecutor: Send + Sync + 'static {
    async fn execute(&self, spec: &PendingBatchSpec) -> anyhow::Result<Vec<ExecutionLogEntry>>;
}
