//! Row decoding for batch-changes payloads.

use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;

use batchforge_batches::{
    BatchChangeAssoc, BatchSpec, BatchSpecResolutionJob, Changeset, ChangesetJob,
    PendingBatchSpec, ReconcilerState,
};
use batchforge_core::{BatchChangeId, BatchSpecId, ChangesetId, RepoId, UserId};

use crate::jobs::PgPayload;

/// Columns a changeset is decoded from, besides the engine-owned ones
/// (`id`, `failure_message`, `num_resets`, `num_failures`).
pub(crate) const CHANGESET_COLUMNS: [&str; 10] = [
    "repo_id",
    "batch_change_ids",
    "owned_by_batch_change_id",
    "external_id",
    "external_service_type",
    "reconciler_state",
    "previous_failure_message",
    "sync_error_message",
    "detached_at",
    "updated_at",
];

fn column_error(
    index: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source: Box::new(source),
    }
}

impl PgPayload for BatchSpecResolutionJob {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            batch_spec_id: BatchSpecId::new(row.try_get("batch_spec_id")?),
            initiator_id: UserId::new(row.try_get("initiator_id")?),
            allow_unsupported: row.try_get("allow_unsupported")?,
            allow_ignored: row.try_get("allow_ignored")?,
        })
    }
}

impl PgPayload for ChangesetJob {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            bulk_group: row.try_get("bulk_group")?,
            batch_change_id: BatchChangeId::new(row.try_get("batch_change_id")?),
            changeset_id: ChangesetId::new(row.try_get("changeset_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl PgPayload for Changeset {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("reconciler_state")?;
        let reconciler_state = state
            .parse::<ReconcilerState>()
            .map_err(|e| column_error("reconciler_state", e))?;
        let Json(batch_changes): Json<Vec<BatchChangeAssoc>> = row.try_get("batch_change_ids")?;
        let owned_by: Option<i64> = row.try_get("owned_by_batch_change_id")?;

        Ok(Self {
            id: ChangesetId::new(row.try_get("id")?),
            repo_id: RepoId::new(row.try_get("repo_id")?),
            batch_changes,
            owned_by_batch_change_id: owned_by.map(BatchChangeId::new),
            external_id: row.try_get("external_id")?,
            external_service_type: row.try_get("external_service_type")?,
            reconciler_state,
            failure_message: row.try_get("failure_message")?,
            previous_failure_message: row.try_get("previous_failure_message")?,
            sync_error_message: row.try_get("sync_error_message")?,
            num_resets: row.try_get("num_resets")?,
            num_failures: row.try_get("num_failures")?,
            detached_at: row.try_get("detached_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl PgPayload for PendingBatchSpec {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: UserId::new(row.try_get("user_id")?),
            raw_spec: row.try_get("raw_spec")?,
            batch_spec_rand_id: row.try_get("batch_spec_rand_id")?,
        })
    }
}

pub(crate) fn batch_spec_from_row(row: &PgRow) -> Result<BatchSpec, sqlx::Error> {
    Ok(BatchSpec {
        id: BatchSpecId::new(row.try_get("id")?),
        rand_id: row.try_get("rand_id")?,
        user_id: UserId::new(row.try_get("user_id")?),
        raw_spec: row.try_get("raw_spec")?,
        created_at: row.try_get("created_at")?,
    })
}
