//! Transaction-scoped access to the batch-changes tables.
//!
//! Handlers receive a `BatchesTx` from the worker's `Transact` source; every
//! write made through it is committed or rolled back together with the
//! handler's result.
//!
//! Two implementations exist:
//! - `InMemoryBatchesStore`: staged writes applied on commit (tests, dev)
//! - `sqlx::Transaction<Postgres>`: the production path

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::instrument;

use batchforge_batches::{BatchSpec, BatchSpecWorkspace, Changeset};
use batchforge_core::{BatchSpecId, ChangesetId, WorkspaceId};

use super::rows::{self, CHANGESET_COLUMNS};
use crate::jobs::postgres::map_sqlx_error;
use crate::jobs::{PgPayload, StoreError, Transact};

/// Batch-changes reads and writes inside one business transaction.
#[async_trait]
pub trait BatchesTx: Send + 'static {
    async fn get_batch_spec(&mut self, id: BatchSpecId) -> Result<BatchSpec, StoreError>;

    /// Insert all workspaces, returning their ids in input order.
    async fn create_batch_spec_workspaces(
        &mut self,
        workspaces: &[BatchSpecWorkspace],
    ) -> Result<Vec<WorkspaceId>, StoreError>;

    async fn get_changeset(&mut self, id: ChangesetId) -> Result<Changeset, StoreError>;

    async fn update_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError>;

    /// Link a pending execution to the batch spec it produced.
    async fn set_pending_batch_spec_result(
        &mut self,
        execution_id: i64,
        batch_spec_rand_id: &str,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Tables {
    batch_specs: BTreeMap<BatchSpecId, BatchSpec>,
    workspaces: BTreeMap<WorkspaceId, BatchSpecWorkspace>,
    changesets: BTreeMap<ChangesetId, Changeset>,
    pending_results: BTreeMap<i64, String>,
}

#[derive(Debug, Clone)]
enum Write {
    Workspace(WorkspaceId, BatchSpecWorkspace),
    Changeset(Changeset),
    PendingResult(i64, String),
}

impl Tables {
    fn apply(&mut self, write: Write) {
        match write {
            Write::Workspace(id, ws) => {
                self.workspaces.insert(id, ws);
            }
            Write::Changeset(cs) => {
                self.changesets.insert(cs.id, cs);
            }
            Write::PendingResult(id, rand_id) => {
                self.pending_results.insert(id, rand_id);
            }
        }
    }
}

/// In-memory batch-changes tables.
///
/// A transaction reads a snapshot taken at `begin` plus its own writes;
/// `commit` replays its writes onto the shared tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatchesStore {
    tables: Arc<Mutex<Tables>>,
    next_workspace_id: Arc<AtomicI64>,
}

/// Open transaction on an `InMemoryBatchesStore`.
#[derive(Debug)]
pub struct InMemoryBatchesTx {
    snapshot: Tables,
    writes: Vec<Write>,
    next_workspace_id: Arc<AtomicI64>,
}

impl InMemoryBatchesStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_batch_spec(&self, spec: BatchSpec) -> Result<(), StoreError> {
        self.lock()?.batch_specs.insert(spec.id, spec);
        Ok(())
    }

    pub fn insert_changeset(&self, changeset: Changeset) -> Result<(), StoreError> {
        self.lock()?.changesets.insert(changeset.id, changeset);
        Ok(())
    }

    pub fn changeset(&self, id: ChangesetId) -> Result<Option<Changeset>, StoreError> {
        Ok(self.lock()?.changesets.get(&id).cloned())
    }

    /// Committed workspaces of one batch spec, in id order.
    pub fn workspaces(
        &self,
        batch_spec_id: BatchSpecId,
    ) -> Result<Vec<BatchSpecWorkspace>, StoreError> {
        Ok(self
            .lock()?
            .workspaces
            .values()
            .filter(|ws| ws.batch_spec_id == batch_spec_id)
            .cloned()
            .collect())
    }

    pub fn pending_result(&self, execution_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.pending_results.get(&execution_id).cloned())
    }
}

#[async_trait]
impl Transact for InMemoryBatchesStore {
    type Tx = InMemoryBatchesTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryBatchesTx {
            snapshot: self.lock()?.clone(),
            writes: Vec::new(),
            next_workspace_id: Arc::clone(&self.next_workspace_id),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        for write in tx.writes {
            tables.apply(write);
        }
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<(), StoreError> {
        Ok(())
    }
}

impl InMemoryBatchesTx {
    fn write(&mut self, write: Write) {
        self.snapshot.apply(write.clone());
        self.writes.push(write);
    }
}

#[async_trait]
impl BatchesTx for InMemoryBatchesTx {
    async fn get_batch_spec(&mut self, id: BatchSpecId) -> Result<BatchSpec, StoreError> {
        self.snapshot
            .batch_specs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id.get()))
    }

    async fn create_batch_spec_workspaces(
        &mut self,
        workspaces: &[BatchSpecWorkspace],
    ) -> Result<Vec<WorkspaceId>, StoreError> {
        let mut ids = Vec::with_capacity(workspaces.len());
        for ws in workspaces {
            // Ids are never reused, even when the transaction rolls back.
            let id = WorkspaceId::new(self.next_workspace_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.write(Write::Workspace(id, ws.clone()));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn get_changeset(&mut self, id: ChangesetId) -> Result<Changeset, StoreError> {
        self.snapshot
            .changesets
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id.get()))
    }

    async fn update_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError> {
        if !self.snapshot.changesets.contains_key(&changeset.id) {
            return Err(StoreError::NotFound(changeset.id.get()));
        }
        self.write(Write::Changeset(changeset.clone()));
        Ok(())
    }

    async fn set_pending_batch_spec_result(
        &mut self,
        execution_id: i64,
        batch_spec_rand_id: &str,
    ) -> Result<(), StoreError> {
        self.write(Write::PendingResult(execution_id, batch_spec_rand_id.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[async_trait]
impl BatchesTx for Transaction<'static, Postgres> {
    #[instrument(skip(self), fields(batch_spec_id = %id), err)]
    async fn get_batch_spec(&mut self, id: BatchSpecId) -> Result<BatchSpec, StoreError> {
        let row = sqlx::query(
            "SELECT id, rand_id, user_id, raw_spec, created_at FROM batch_specs WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&mut **self)
        .await
        .map_err(|e| map_sqlx_error("get_batch_spec", e))?
        .ok_or(StoreError::NotFound(id.get()))?;

        rows::batch_spec_from_row(&row).map_err(|e| map_sqlx_error("decode_batch_spec", e))
    }

    #[instrument(skip(self, workspaces), fields(count = workspaces.len()), err)]
    async fn create_batch_spec_workspaces(
        &mut self,
        workspaces: &[BatchSpecWorkspace],
    ) -> Result<Vec<WorkspaceId>, StoreError> {
        let mut ids = Vec::with_capacity(workspaces.len());
        for ws in workspaces {
            let changeset_spec_ids: Vec<i64> =
                ws.changeset_spec_ids.iter().map(|id| id.get()).collect();
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO batch_spec_workspaces (
                    batch_spec_id, changeset_spec_ids, repo_id, branch, commit, path,
                    file_matches, steps, only_fetch_workspace, unsupported, ignored
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING id
                "#,
            )
            .bind(ws.batch_spec_id.get())
            .bind(Json(&changeset_spec_ids))
            .bind(ws.repo_id.get())
            .bind(&ws.branch)
            .bind(&ws.commit)
            .bind(&ws.path)
            .bind(&ws.file_matches)
            .bind(Json(&ws.steps))
            .bind(ws.only_fetch_workspace)
            .bind(ws.unsupported)
            .bind(ws.ignored)
            .fetch_one(&mut **self)
            .await
            .map_err(|e| map_sqlx_error("create_batch_spec_workspace", e))?;
            ids.push(WorkspaceId::new(id));
        }
        Ok(ids)
    }

    #[instrument(skip(self), fields(changeset_id = %id), err)]
    async fn get_changeset(&mut self, id: ChangesetId) -> Result<Changeset, StoreError> {
        let sql = format!(
            "SELECT id, failure_message, num_resets, num_failures, {} FROM changesets WHERE id = $1",
            CHANGESET_COLUMNS.join(", "),
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut **self)
            .await
            .map_err(|e| map_sqlx_error("get_changeset", e))?
            .ok_or(StoreError::NotFound(id.get()))?;

        Changeset::from_pg_row(&row).map_err(|e| map_sqlx_error("decode_changeset", e))
    }

    #[instrument(skip(self, changeset), fields(changeset_id = %changeset.id), err)]
    async fn update_changeset(&mut self, changeset: &Changeset) -> Result<(), StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE changesets
            SET
                batch_change_ids = $2,
                owned_by_batch_change_id = $3,
                reconciler_state = $4,
                failure_message = $5,
                previous_failure_message = $6,
                sync_error_message = $7,
                num_resets = $8,
                num_failures = $9,
                detached_at = $10,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id
            "#,
        )
        .bind(changeset.id.get())
        .bind(Json(&changeset.batch_changes))
        .bind(changeset.owned_by_batch_change_id.map(|id| id.get()))
        .bind(changeset.reconciler_state.as_str())
        .bind(&changeset.failure_message)
        .bind(&changeset.previous_failure_message)
        .bind(&changeset.sync_error_message)
        .bind(changeset.num_resets)
        .bind(changeset.num_failures)
        .bind(changeset.detached_at)
        .fetch_optional(&mut **self)
        .await
        .map_err(|e| map_sqlx_error("update_changeset", e))?;

        if row.is_none() {
            return Err(StoreError::NotFound(changeset.id.get()));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_pending_batch_spec_result(
        &mut self,
        execution_id: i64,
        batch_spec_rand_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE batch_spec_executions SET batch_spec_rand_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(execution_id)
        .bind(batch_spec_rand_id)
        .execute(&mut **self)
        .await
        .map_err(|e| map_sqlx_error("set_pending_batch_spec_result", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(execution_id));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;

    use batchforge_batches::{BatchChangeAssoc, ReconcilerState};
    use batchforge_core::{BatchChangeId, RepoId, UserId};

    use super::*;

    pub fn batch_spec(id: i64, raw_spec: &str) -> BatchSpec {
        BatchSpec {
            id: BatchSpecId::new(id),
            rand_id: format!("spec-{id}"),
            user_id: UserId::new(1),
            raw_spec: raw_spec.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn changeset(id: i64, batch_change: i64, state: ReconcilerState) -> Changeset {
        Changeset {
            id: ChangesetId::new(id),
            repo_id: RepoId::new(1),
            batch_changes: vec![BatchChangeAssoc::new(BatchChangeId::new(batch_change))],
            owned_by_batch_change_id: Some(BatchChangeId::new(batch_change)),
            external_id: Some("12".into()),
            external_service_type: "github".into(),
            reconciler_state: state,
            failure_message: None,
            previous_failure_message: None,
            sync_error_message: None,
            num_resets: 0,
            num_failures: 0,
            detached_at: None,
            updated_at: Utc::now(),
        }
    }
}
