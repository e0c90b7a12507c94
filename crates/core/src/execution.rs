//! Execution log entries recorded against queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of out-of-process execution, captured verbatim.
///
/// `out` holds the interleaved output of the step, one line per output line,
/// each prefixed with `stdout: ` or `stderr: `. `exit_code` and `duration_ms`
/// are absent while the step is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    /// Dot-path naming the step, e.g. `step.src.0`.
    pub key: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub out: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl ExecutionLogEntry {
    pub fn new(key: impl Into<String>, command: Vec<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            command,
            start_time,
            exit_code: None,
            out: String::new(),
            duration_ms: None,
        }
    }

    /// Record the outcome of a finished step.
    pub fn finish(mut self, exit_code: i32, out: impl Into<String>, duration_ms: i64) -> Self {
        self.exit_code = Some(exit_code);
        self.out = out.into();
        self.duration_ms = Some(duration_ms);
        self
    }
}
