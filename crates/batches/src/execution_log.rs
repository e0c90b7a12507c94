//! Recovers structured results from the captured output of an executor step.
//!
//! The executor prints JSON progress events on stdout, interleaved with
//! arbitrary stderr noise. Each captured line is prefixed with `stdout: ` or
//! `stderr: `. Only stdout lines that decode as an event are considered; all
//! other lines are skipped.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Deserialize;

use batchforge_core::ExecutionLogEntry;

/// Key of the step that runs the batch tooling.
pub const SOURCE_STEP_KEY: &str = "step.src.0";

pub const OPERATION_CREATING_BATCH_SPEC: &str = "CREATING_BATCH_SPEC";
pub const OPERATION_UPLOADING_CHANGESET_SPECS: &str = "UPLOADING_CHANGESET_SPECS";

const STDOUT_PREFIX: &str = "stdout: ";
const STATUS_SUCCESS: &str = "SUCCESS";

const RELAY_ID: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Both variants mean "nothing to recover"; callers should test
/// [`LogScrapeError::is_not_found`] rather than match on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogScrapeError {
    #[error("no matching step {0:?} in execution log")]
    NoMatchingStep(String),
    #[error("no {0} found in execution log")]
    NotFound(&'static str),
}

impl LogScrapeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoMatchingStep(_) | Self::NotFound(_))
    }
}

#[derive(Debug, Deserialize)]
struct Event {
    operation: String,
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Extract the batch spec ID from the last successful `CREATING_BATCH_SPEC` event.
///
/// The event carries the apply URL either in `metadata.batchSpecURL` or in
/// `message`; its last path segment is the opaque batch spec ID.
pub fn batch_spec_id(
    entries: &[ExecutionLogEntry],
    step_key: &str,
) -> Result<String, LogScrapeError> {
    let event = last_success(entries, step_key, OPERATION_CREATING_BATCH_SPEC)?;

    let url = event
        .metadata
        .as_ref()
        .and_then(|m| m.get("batchSpecURL"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or(event.message)
        .ok_or(LogScrapeError::NotFound("batch spec URL"))?;

    let segment = last_path_segment(&url).ok_or(LogScrapeError::NotFound("batch spec URL"))?;
    decode_relay_id(segment).ok_or(LogScrapeError::NotFound("batch spec URL"))
}

/// Extract changeset spec IDs from the last successful `UPLOADING_CHANGESET_SPECS` event.
pub fn changeset_spec_ids(
    entries: &[ExecutionLogEntry],
    step_key: &str,
) -> Result<Vec<String>, LogScrapeError> {
    let event = last_success(entries, step_key, OPERATION_UPLOADING_CHANGESET_SPECS)?;

    let ids = event
        .metadata
        .as_ref()
        .and_then(|m| m.get("ids"))
        .and_then(|v| v.as_array())
        .filter(|ids| !ids.is_empty())
        .ok_or(LogScrapeError::NotFound("changeset spec IDs"))?;

    ids.iter()
        .map(|id| id.as_str().and_then(decode_relay_id))
        .collect::<Option<Vec<_>>>()
        .ok_or(LogScrapeError::NotFound("changeset spec IDs"))
}

fn last_success(
    entries: &[ExecutionLogEntry],
    step_key: &str,
    operation: &str,
) -> Result<Event, LogScrapeError> {
    // A step re-run after a retry appends a new entry under the same key.
    let entry = entries
        .iter()
        .rev()
        .find(|e| e.key == step_key)
        .ok_or_else(|| LogScrapeError::NoMatchingStep(step_key.to_string()))?;

    entry
        .out
        .lines()
        .filter_map(|line| line.strip_prefix(STDOUT_PREFIX))
        .filter_map(|line| serde_json::from_str::<Event>(line).ok())
        .filter(|e| e.operation == operation && e.status == STATUS_SUCCESS)
        .last()
        .ok_or(LogScrapeError::NotFound("matching event"))
}

fn last_path_segment(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// `base64("Kind:\"raw\"")` -> `raw`. Payloads without the wrapper are returned as decoded.
fn decode_relay_id(encoded: &str) -> Option<String> {
    let bytes = RELAY_ID.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;

    match decoded.split_once(':') {
        Some((_, quoted)) => match serde_json::from_str::<String>(quoted) {
            Ok(raw) => Some(raw),
            Err(_) => Some(decoded),
        },
        None => Some(decoded),
    }
}
