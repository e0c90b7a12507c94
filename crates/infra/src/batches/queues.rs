//! Queue bindings for the batch-changes tables.

use std::time::Duration;

use crate::jobs::QueueOptions;

pub const RESOLUTION_JOBS: &str = "batch_spec_resolution_jobs";
pub const CHANGESET_JOBS: &str = "changeset_jobs";
pub const RECONCILER: &str = "changesets";
pub const PENDING_BATCH_SPECS: &str = "batch_spec_executions";

const STALLED_MAX_AGE: Duration = Duration::from_secs(60);
const RETRY_AFTER: Duration = Duration::from_secs(5);

/// Workspace resolution. Jobs that already failed once go first, then the newest.
pub fn resolution_jobs() -> QueueOptions {
    QueueOptions::new("batch_spec_resolution_worker", RESOLUTION_JOBS)
        .with_columns([
            "batch_spec_id",
            "initiator_id",
            "allow_unsupported",
            "allow_ignored",
        ])
        .with_order_by("(num_failures > 0) DESC, updated_at DESC")
        .with_stalled_max_age(STALLED_MAX_AGE)
        .with_max_num_resets(60)
        .with_retry(3, RETRY_AFTER)
}

/// Bulk operations, oldest first.
pub fn changeset_jobs() -> QueueOptions {
    QueueOptions::new("bulk_operation_worker", CHANGESET_JOBS)
        .with_columns([
            "bulk_group",
            "batch_change_id",
            "changeset_id",
            "user_id",
            "job_type",
            "payload",
        ])
        .with_order_by("id ASC")
        .with_stalled_max_age(STALLED_MAX_AGE)
        .with_max_num_resets(60)
        .with_retry(5, RETRY_AFTER)
}

/// Changesets awaiting reconciliation. The table keeps its state in
/// `reconciler_state`.
pub fn reconciler() -> QueueOptions {
    QueueOptions::new("reconciler_worker", RECONCILER)
        .with_columns(super::rows::CHANGESET_COLUMNS)
        .with_alternate_column("state", "reconciler_state")
        .with_order_by("updated_at ASC")
        .with_stalled_max_age(STALLED_MAX_AGE)
        .with_max_num_resets(10)
        .with_retry(60, RETRY_AFTER)
}

/// Specs submitted for server-side execution.
pub fn pending_batch_specs() -> QueueOptions {
    QueueOptions::new("pending_batch_spec_worker", PENDING_BATCH_SPECS)
        .with_columns(["user_id", "raw_spec", "batch_spec_rand_id"])
        .with_order_by("id ASC")
        .with_stalled_max_age(STALLED_MAX_AGE)
        .with_max_num_resets(3)
        .with_retry(3, RETRY_AFTER)
}
