//! `batchforge-batches` - the batch-changes domain.
//!
//! Pure types and rules: batch spec documents, resolved workspaces, changesets
//! and their bulk operations, and the execution-log scraper. Persistence and
//! the queue engine live in `batchforge-infra`.

pub mod batch_spec;
pub mod changeset;
pub mod execution_log;
pub mod jobs;
pub mod ports;
pub mod workspace;

pub use batch_spec::{BatchSpec, BatchSpecDocument, PendingBatchSpec, SpecParseError, Step};
pub use changeset::{BatchChangeAssoc, Changeset, ReconcilerState};
pub use execution_log::{LogScrapeError, SOURCE_STEP_KEY};
pub use jobs::{
    BatchSpecResolutionJob, BulkOperation, ChangesetJob, ChangesetJobType, InvalidJobType,
};
pub use ports::{ChangesetSource, Reconciler, SpecExecutor};
pub use workspace::{
    BatchSpecWorkspace, RepoWorkspace, Resolution, ResolveOptions, WorkspaceResolver,
};
