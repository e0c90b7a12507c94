//! Postgres-backed queue store.
//!
//! Every statement is rendered from the queue's [`QueueOptions`]: engine
//! columns are addressed by logical name and translated through
//! `alternate_column_names`, so one implementation serves tables whose
//! bookkeeping columns are named differently (e.g. `reconciler_state`).
//!
//! ## Claim exclusivity
//!
//! `dequeue` selects its candidate with `FOR UPDATE SKIP LOCKED` inside the
//! same statement that flips it to `processing`. Concurrent workers in any
//! number of processes skip rows locked by another claimer instead of
//! blocking on them, and never observe the same row as claimable twice.
//!
//! ## Claim ownership
//!
//! Heartbeats, execution log writes, requeues and the `mark_*` transitions
//! all match on `state = 'processing' AND worker_hostname = <caller>`. A
//! worker whose claim was reset and handed to another worker matches no row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | ColumnDecode / ColumnNotFound / Decode | `Decode` |
//! | anything else | `Transient` |

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};

use batchforge_core::ExecutionLogEntry;

use super::store::{Store, StoreError};
use super::types::{QueueOptions, QueueRecord, RecordState, ResetOutcome};
use super::worker::Transact;

/// Decoding of a queue payload from the columns produced by the queue's
/// `column_expressions`.
pub trait PgPayload: Sized + Send + Sync + Unpin + 'static {
    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error>;
}

impl PgPayload for () {
    fn from_pg_row(_: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(())
    }
}

const ENGINE_COLUMNS: [&str; 11] = [
    "id",
    "state",
    "num_failures",
    "num_resets",
    "failure_message",
    "started_at",
    "finished_at",
    "process_after",
    "last_heartbeat_at",
    "worker_hostname",
    "execution_logs",
];

impl<'r, P: PgPayload> FromRow<'r, PgRow> for QueueRecord<P> {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<RecordState>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "state".to_string(),
                source: e.into(),
            })?;
        let execution_logs: Option<Vec<Json<ExecutionLogEntry>>> = row.try_get("execution_logs")?;
        let worker_hostname: Option<String> = row.try_get("worker_hostname")?;

        Ok(QueueRecord {
            id: row.try_get("id")?,
            state,
            attempts: row.try_get("num_failures")?,
            num_resets: row.try_get("num_resets")?,
            failure_message: row.try_get("failure_message")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            process_after: row.try_get("process_after")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            worker_hostname: worker_hostname.unwrap_or_default(),
            execution_logs: execution_logs
                .unwrap_or_default()
                .into_iter()
                .map(|Json(e)| e)
                .collect(),
            payload: P::from_pg_row(row)?,
        })
    }
}

/// Postgres queue over one table.
pub struct PostgresStore<P> {
    pool: Arc<PgPool>,
    options: QueueOptions,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for PostgresStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            options: self.options.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> PostgresStore<P> {
    pub fn new(pool: Arc<PgPool>, options: QueueOptions) -> Self {
        Self {
            pool,
            options,
            _payload: PhantomData,
        }
    }

    /// Physical column name for a logical engine column.
    fn col(&self, logical: &'static str) -> &str {
        self.options.column(logical)
    }

    fn select_list(&self) -> String {
        ENGINE_COLUMNS
            .iter()
            .map(|&c| format!("{} AS {}", self.col(c), c))
            .chain(self.options.column_expressions.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn order_by(&self) -> String {
        format!("{}, {}", self.options.order_by_expression, self.col("id"))
    }
}

impl<P: PgPayload> PostgresStore<P> {
    async fn load(&self, id: i64) -> Result<Option<QueueRecord<P>>, StoreError> {
        let sql = format!(
            "SELECT {select} FROM {relation} WHERE {id} = $1",
            select = self.select_list(),
            relation = self.options.read_relation(),
            id = self.col("id"),
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|r| QueueRecord::<P>::from_row(&r).map_err(|e| map_sqlx_error("decode_record", e)))
            .transpose()
    }

    /// `WHERE` clause matching a record still held by the worker bound at `$2`.
    fn held(&self) -> String {
        format!(
            "{id} = $1 AND {state} = 'processing' AND {worker_hostname} = $2",
            id = self.col("id"),
            state = self.col("state"),
            worker_hostname = self.col("worker_hostname"),
        )
    }

    /// Shared body of the `mark_*` transitions: returns whether a held row matched.
    async fn transition(
        &self,
        op: &str,
        sql: &str,
        id: i64,
        worker_hostname: &str,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut query = sqlx::query(sql).bind(id).bind(worker_hostname);
        if let Some(message) = message {
            query = query.bind(message);
        }
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl<P: PgPayload> Store<P> for PostgresStore<P> {
    fn options(&self) -> &QueueOptions {
        &self.options
    }

    #[instrument(skip(self), fields(queue = %self.options.name, record_id = field::Empty), err)]
    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<QueueRecord<P>>, StoreError> {
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT {id} FROM {table}
                WHERE {state} = 'queued' AND ({process_after} IS NULL OR {process_after} <= NOW())
                ORDER BY {order_by}
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE {table}
            SET
                {state} = 'processing',
                {started_at} = NOW(),
                {finished_at} = NULL,
                {failure_message} = NULL,
                {logs} = NULL,
                {last_heartbeat_at} = NOW(),
                {worker_hostname} = $1
            WHERE {id} IN (SELECT {id} FROM candidate)
            RETURNING {id}
            "#,
            table = self.options.table_name,
            id = self.col("id"),
            state = self.col("state"),
            process_after = self.col("process_after"),
            started_at = self.col("started_at"),
            finished_at = self.col("finished_at"),
            failure_message = self.col("failure_message"),
            logs = self.col("execution_logs"),
            last_heartbeat_at = self.col("last_heartbeat_at"),
            worker_hostname = self.col("worker_hostname"),
            order_by = self.order_by(),
        );

        let claimed: Option<i64> = sqlx::query_scalar(&sql)
            .bind(worker_hostname)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dequeue", e))?;

        let Some(id) = claimed else {
            return Ok(None);
        };
        Span::current().record("record_id", id);
        self.load(id).await
    }

    #[instrument(skip(self), fields(queue = %self.options.name), err)]
    async fn heartbeat(&self, ids: &[i64], worker_hostname: &str) -> Result<Vec<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            UPDATE {table} SET {last_heartbeat_at} = NOW()
            WHERE {id} = ANY($1) AND {state} = 'processing' AND {worker_hostname} = $2
            RETURNING {id}
            "#,
            table = self.options.table_name,
            id = self.col("id"),
            state = self.col("state"),
            last_heartbeat_at = self.col("last_heartbeat_at"),
            worker_hostname = self.col("worker_hostname"),
        );
        sqlx::query_scalar(&sql)
            .bind(ids)
            .bind(worker_hostname)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("heartbeat", e))
    }

    #[instrument(skip(self), fields(queue = %self.options.name), err)]
    async fn requeue(
        &self,
        id: i64,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET {state} = 'queued', {process_after} = $3, {last_heartbeat_at} = NULL
            WHERE {held}
            "#,
            table = self.options.table_name,
            state = self.col("state"),
            process_after = self.col("process_after"),
            last_heartbeat_at = self.col("last_heartbeat_at"),
            held = self.held(),
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(worker_hostname)
            .bind(after)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(queue = %self.options.name, key = %entry.key), err)]
    async fn add_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<i32, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET {logs} = array_append(COALESCE({logs}, '{{}}'::jsonb[]), $3::jsonb)
            WHERE {held}
            RETURNING array_length({logs}, 1)
            "#,
            table = self.options.table_name,
            logs = self.col("execution_logs"),
            held = self.held(),
        );
        sqlx::query_scalar::<_, i32>(&sql)
            .bind(id)
            .bind(worker_hostname)
            .bind(Json(entry))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_execution_log_entry", e))?
            .ok_or(StoreError::NotHeld(id))
    }

    #[instrument(skip(self, entry), fields(queue = %self.options.name), err)]
    async fn update_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry_id: i32,
        entry: &ExecutionLogEntry,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET {logs}[$3] = $4::jsonb
            WHERE {held} AND $3 >= 1 AND array_length({logs}, 1) >= $3
            "#,
            table = self.options.table_name,
            logs = self.col("execution_logs"),
            held = self.held(),
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(worker_hostname)
            .bind(entry_id)
            .bind(Json(entry))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_execution_log_entry", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionLogEntryNotUpdated { id, entry_id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.options.name), err)]
    async fn mark_complete(&self, id: i64, worker_hostname: &str) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table} SET {state} = 'completed', {finished_at} = NOW()
            WHERE {held}
            RETURNING {id}
            "#,
            table = self.options.table_name,
            id = self.col("id"),
            state = self.col("state"),
            finished_at = self.col("finished_at"),
            held = self.held(),
        );
        self.transition("mark_complete", &sql, id, worker_hostname, None).await
    }

    #[instrument(skip(self), fields(queue = %self.options.name), err)]
    async fn mark_errored(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool, StoreError> {
        // SET expressions see the pre-update row, so `{failures} + 1` is the new count throughout.
        let sql = format!(
            r#"
            UPDATE {table}
            SET
                {failures} = {failures} + 1,
                {failure_message} = $3,
                {state} = CASE WHEN {failures} + 1 >= {max} THEN 'failed' ELSE 'queued' END,
                {finished_at} = CASE WHEN {failures} + 1 >= {max} THEN NOW() ELSE NULL END,
                {process_after} = CASE WHEN {failures} + 1 >= {max} THEN {process_after}
                    ELSE NOW() + make_interval(secs => {retry_after}) END
            WHERE {held}
            RETURNING {id}
            "#,
            table = self.options.table_name,
            id = self.col("id"),
            state = self.col("state"),
            failures = self.col("num_failures"),
            failure_message = self.col("failure_message"),
            finished_at = self.col("finished_at"),
            process_after = self.col("process_after"),
            max = self.options.max_num_retries,
            retry_after = self.options.retry_after.as_secs_f64(),
            held = self.held(),
        );
        self.transition("mark_errored", &sql, id, worker_hostname, Some(failure_message))
            .await
    }

    #[instrument(skip(self), fields(queue = %self.options.name), err)]
    async fn mark_failed(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET
                {state} = 'failed',
                {finished_at} = NOW(),
                {failure_message} = $3,
                {failures} = {failures} + 1
            WHERE {held}
            RETURNING {id}
            "#,
            table = self.options.table_name,
            id = self.col("id"),
            state = self.col("state"),
            failures = self.col("num_failures"),
            failure_message = self.col("failure_message"),
            finished_at = self.col("finished_at"),
            held = self.held(),
        );
        self.transition("mark_failed", &sql, id, worker_hostname, Some(failure_message))
            .await
    }

    #[instrument(
        skip(self),
        fields(queue = %self.options.name, reset = field::Empty, escalated = field::Empty),
        err
    )]
    async fn reset_stalled(&self) -> Result<ResetOutcome, StoreError> {
        let sql = format!(
            r#"
            WITH stalled AS (
                SELECT
                    {id} AS stalled_id,
                    {num_resets} AS prior_resets,
                    EXTRACT(EPOCH FROM NOW() - {last_heartbeat_at})::float8 AS age_secs
                FROM {table}
                WHERE {state} = 'processing'
                  AND (
                      {last_heartbeat_at} IS NULL
                      OR NOW() - {last_heartbeat_at} > make_interval(secs => $1)
                  )
                FOR UPDATE SKIP LOCKED
            ),
            requeued AS (
                UPDATE {table}
                SET
                    {state} = 'queued',
                    {num_resets} = {num_resets} + 1,
                    {last_heartbeat_at} = NULL,
                    {process_after} = NOW()
                FROM stalled
                WHERE {table}.{id} = stalled.stalled_id AND stalled.prior_resets < $2
                RETURNING stalled.stalled_id, stalled.age_secs
            ),
            escalated AS (
                UPDATE {table}
                SET
                    {state} = 'errored',
                    {finished_at} = NOW(),
                    {failure_message} = $3,
                    {last_heartbeat_at} = NULL
                FROM stalled
                WHERE {table}.{id} = stalled.stalled_id AND stalled.prior_resets >= $2
                RETURNING stalled.stalled_id, stalled.age_secs
            )
            SELECT TRUE AS requeued, stalled_id, age_secs FROM requeued
            UNION ALL
            SELECT FALSE AS requeued, stalled_id, age_secs FROM escalated
            "#,
            table = self.options.table_name,
            id = self.col("id"),
            state = self.col("state"),
            num_resets = self.col("num_resets"),
            last_heartbeat_at = self.col("last_heartbeat_at"),
            process_after = self.col("process_after"),
            finished_at = self.col("finished_at"),
            failure_message = self.col("failure_message"),
        );

        let rows = sqlx::query(&sql)
            .bind(self.options.stalled_max_age.as_secs_f64())
            .bind(self.options.max_num_resets)
            .bind(&self.options.reset_failure_message)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_stalled", e))?;

        let mut outcome = ResetOutcome::default();
        for row in rows {
            let decode = |e| map_sqlx_error("reset_stalled", e);
            let requeued: bool = row.try_get("requeued").map_err(decode)?;
            let id: i64 = row.try_get("stalled_id").map_err(decode)?;
            let age: Option<f64> = row.try_get("age_secs").map_err(decode)?;
            let age = age
                .and_then(|s| Duration::try_from_secs_f64(s.max(0.0)).ok())
                .unwrap_or(Duration::MAX);
            if requeued {
                outcome.reset.insert(id, age);
            } else {
                outcome.escalated.insert(id, age);
            }
        }

        let span = Span::current();
        span.record("reset", outcome.reset.len());
        span.record("escalated", outcome.escalated.len());
        Ok(outcome)
    }

    #[instrument(skip(self), fields(queue = %self.options.name), err)]
    async fn queued_count(&self, include_processing: bool) -> Result<i64, StoreError> {
        let states = if include_processing {
            "'queued', 'processing'"
        } else {
            "'queued'"
        };
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE {state} IN ({states})",
            table = self.options.table_name,
            state = self.col("state"),
        );
        sqlx::query_scalar(&sql)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queued_count", e))
    }
}

/// Opens the per-record business transactions handlers run in.
#[derive(Debug, Clone)]
pub struct PostgresTransactor {
    pool: Arc<PgPool>,
}

impl PostgresTransactor {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transact for PostgresTransactor {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => StoreError::Decode(format!("{operation}: {err}")),
        sqlx::Error::Database(db_err) => {
            StoreError::Transient(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Transient(format!("sqlx error in {}: {}", operation, err)),
    }
}
