//! Queue records, their states, and per-queue bindings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchforge_core::ExecutionLogEntry;

/// Queue record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Waiting to be claimed
    Queued,
    /// Claimed by exactly one worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Reset budget exhausted after repeated stalls
    Errored,
    /// Retry budget exhausted, or a non-retryable handler error
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Failed)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown record state {other:?}")),
        }
    }
}

/// A row of some queue table: the engine-owned bookkeeping plus a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord<P> {
    pub id: i64,
    pub state: RecordState,
    /// Handler failures so far (retry budget).
    pub attempts: i32,
    /// Stall recoveries so far (reset budget).
    pub num_resets: i32,
    pub failure_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_hostname: String,
    pub execution_logs: Vec<ExecutionLogEntry>,
    pub payload: P,
}

impl<P> QueueRecord<P> {
    /// A fresh queued record, as an upstream writer would insert it.
    pub fn queued(id: i64, payload: P) -> Self {
        Self {
            id,
            state: RecordState::Queued,
            attempts: 0,
            num_resets: 0,
            failure_message: None,
            started_at: None,
            finished_at: None,
            process_after: None,
            last_heartbeat_at: None,
            worker_hostname: String::new(),
            execution_logs: Vec::new(),
            payload,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Queued && self.process_after.is_none_or(|at| at <= now)
    }

    /// Whether `worker_hostname` holds the current claim on this record.
    pub fn is_held_by(&self, worker_hostname: &str) -> bool {
        self.state == RecordState::Processing && self.worker_hostname == worker_hostname
    }

    pub(crate) fn mark_processing(&mut self, worker_hostname: &str, now: DateTime<Utc>) {
        self.state = RecordState::Processing;
        self.started_at = Some(now);
        self.finished_at = None;
        self.failure_message = None;
        self.execution_logs.clear();
        self.last_heartbeat_at = Some(now);
        self.worker_hostname = worker_hostname.to_string();
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = RecordState::Completed;
        self.finished_at = Some(now);
    }

    /// Consume one unit of the retry budget; requeue or fail.
    pub(crate) fn mark_errored(&mut self, message: &str, opts: &QueueOptions, now: DateTime<Utc>) {
        self.attempts += 1;
        self.failure_message = Some(message.to_string());
        if self.attempts >= opts.max_num_retries {
            self.state = RecordState::Failed;
            self.finished_at = Some(now);
        } else {
            self.state = RecordState::Queued;
            self.process_after = Some(add_duration(now, opts.retry_after));
        }
    }

    /// Terminal failure regardless of the remaining retry budget.
    pub(crate) fn mark_failed(&mut self, message: &str, now: DateTime<Utc>) {
        self.attempts += 1;
        self.state = RecordState::Failed;
        self.failure_message = Some(message.to_string());
        self.finished_at = Some(now);
    }

    /// Recover from a stall. Returns `true` when the record was requeued and
    /// `false` when the reset budget was already spent.
    pub(crate) fn reset(&mut self, opts: &QueueOptions, now: DateTime<Utc>) -> bool {
        self.last_heartbeat_at = None;
        if self.num_resets < opts.max_num_resets {
            self.num_resets += 1;
            self.state = RecordState::Queued;
            self.process_after = Some(now);
            true
        } else {
            self.state = RecordState::Errored;
            self.failure_message = Some(opts.reset_failure_message.clone());
            self.finished_at = Some(now);
            false
        }
    }
}

/// `at + d`, saturating at the end of representable time.
pub(crate) fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub const DEFAULT_RESET_FAILURE_MESSAGE: &str =
    "job processor died while handling this message too many times";

/// Declarative binding of the engine to one queue table.
///
/// Queries are written against logical column names (`id`, `state`,
/// `num_failures`, ...); `alternate_column_names` maps a logical name to the
/// physical column when the table differs. `order_by_expression` is raw SQL
/// over physical names; the record id is always appended as a final tie-break.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub table_name: String,
    /// Relation records are read from; defaults to `table_name`.
    pub view_name: Option<String>,
    /// Select-list expressions producing the payload columns.
    pub column_expressions: Vec<String>,
    pub alternate_column_names: BTreeMap<String, String>,
    pub order_by_expression: String,
    pub stalled_max_age: Duration,
    pub max_num_resets: i32,
    pub reset_failure_message: String,
    pub retry_after: Duration,
    pub max_num_retries: i32,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            view_name: None,
            column_expressions: Vec::new(),
            alternate_column_names: BTreeMap::new(),
            order_by_expression: "id".to_string(),
            stalled_max_age: Duration::from_secs(5),
            max_num_resets: 3,
            reset_failure_message: DEFAULT_RESET_FAILURE_MESSAGE.to_string(),
            retry_after: Duration::from_secs(5),
            max_num_retries: 3,
        }
    }

    pub fn with_view(mut self, view_name: impl Into<String>) -> Self {
        self.view_name = Some(view_name.into());
        self
    }

    pub fn with_columns<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_expressions = exprs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_alternate_column(
        mut self,
        logical: impl Into<String>,
        physical: impl Into<String>,
    ) -> Self {
        self.alternate_column_names.insert(logical.into(), physical.into());
        self
    }

    pub fn with_order_by(mut self, expr: impl Into<String>) -> Self {
        self.order_by_expression = expr.into();
        self
    }

    pub fn with_stalled_max_age(mut self, age: Duration) -> Self {
        self.stalled_max_age = age;
        self
    }

    pub fn with_max_num_resets(mut self, n: i32) -> Self {
        self.max_num_resets = n;
        self
    }

    pub fn with_retry(mut self, max_num_retries: i32, retry_after: Duration) -> Self {
        self.max_num_retries = max_num_retries;
        self.retry_after = retry_after;
        self
    }

    /// Physical name of a logical engine column.
    pub fn column<'a>(&'a self, logical: &'a str) -> &'a str {
        self.alternate_column_names
            .get(logical)
            .map(String::as_str)
            .unwrap_or(logical)
    }

    pub fn read_relation(&self) -> &str {
        self.view_name.as_deref().unwrap_or(&self.table_name)
    }
}

/// Result of one stall-recovery pass, keyed by record id with the heartbeat
/// age observed when the stall was detected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResetOutcome {
    /// Requeued with one more reset counted.
    pub reset: BTreeMap<i64, Duration>,
    /// Moved to terminal `errored`.
    pub escalated: BTreeMap<i64, Duration>,
}

impl ResetOutcome {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.escalated.is_empty()
    }
}
