//! Changesets and their association with batch changes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchforge_core::{BatchChangeId, ChangesetId, DomainError, RepoId};

/// Reconciler lifecycle state of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerState {
    Scheduled,
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
}

impl ReconcilerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Errored => "errored",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcilerState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(Self::Scheduled),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "errored" => Ok(Self::Errored),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(DomainError::validation(format!("unknown reconciler state {other:?}"))),
        }
    }
}

/// Link between a changeset and one batch change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChangeAssoc {
    pub batch_change_id: BatchChangeId,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub is_archived: bool,
}

impl BatchChangeAssoc {
    pub fn new(batch_change_id: BatchChangeId) -> Self {
        Self {
            batch_change_id,
            detach: false,
            archive: false,
            is_archived: false,
        }
    }
}

/// A code-host change request tracked by one or more batch changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub repo_id: RepoId,
    pub batch_changes: Vec<BatchChangeAssoc>,
    pub owned_by_batch_change_id: Option<BatchChangeId>,
    pub external_id: Option<String>,
    pub external_service_type: String,
    pub reconciler_state: ReconcilerState,
    pub failure_message: Option<String>,
    pub previous_failure_message: Option<String>,
    pub sync_error_message: Option<String>,
    pub num_resets: i32,
    pub num_failures: i32,
    pub detached_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Changeset {
    pub fn attached_to(&self, batch_change_id: BatchChangeId) -> bool {
        self.batch_changes
            .iter()
            .any(|a| a.batch_change_id == batch_change_id && !a.detach)
    }

    /// Mark the association with `batch_change_id` for detachment.
    ///
    /// Returns `false` when the changeset is not associated with it.
    pub fn detach(&mut self, batch_change_id: BatchChangeId) -> bool {
        match self
            .batch_changes
            .iter_mut()
            .find(|a| a.batch_change_id == batch_change_id)
        {
            Some(assoc) => {
                assoc.detach = true;
                true
            }
            None => false,
        }
    }

    /// Put the changeset back into the reconciler's hands.
    ///
    /// Counters are zeroed; the current failure moves to `previous_failure_message`.
    pub fn reset_reconciler_state(&mut self, state: ReconcilerState) {
        self.reconciler_state = state;
        self.num_resets = 0;
        self.num_failures = 0;
        if let Some(msg) = self.failure_message.take() {
            self.previous_failure_message = Some(msg);
        }
        self.sync_error_message = None;
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn changeset(id: i64, batch_change: i64) -> Changeset {
        Changeset {
            id: ChangesetId::new(id),
            repo_id: RepoId::new(1),
            batch_changes: vec![BatchChangeAssoc::new(BatchChangeId::new(batch_change))],
            owned_by_batch_change_id: Some(BatchChangeId::new(batch_change)),
            external_id: Some("12".into()),
            external_service_type: "github".into(),
            reconciler_state: ReconcilerState::Completed,
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
