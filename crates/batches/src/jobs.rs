//! Payloads of the batch-changes background jobs.

use std::fmt;

use serde::{Deserialize, Serialize};

use batchforge_core::{BatchChangeId, BatchSpecId, ChangesetId, UserId};

/// Request to resolve a batch spec into its workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpecResolutionJob {
    pub batch_spec_id: BatchSpecId,
    pub initiator_id: UserId,
    pub allow_unsupported: bool,
    pub allow_ignored: bool,
}

/// Kind of a bulk changeset operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangesetJobType {
    Comment,
    Detach,
    Reenqueue,
    Merge,
}

impl ChangesetJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Detach => "detach",
            Self::Reenqueue => "reenqueue",
            Self::Merge => "merge",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidJobType> {
        match raw {
            "comment" => Ok(Self::Comment),
            "detach" => Ok(Self::Detach),
            "reenqueue" => Ok(Self::Reenqueue),
            "merge" => Ok(Self::Merge),
            other => Err(InvalidJobType::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for ChangesetJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A changeset job whose type or payload can never be processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidJobType {
    #[error("invalid job type {0:?}")]
    UnknownType(String),
    #[error("invalid payload for {job_type} job: {reason}")]
    Payload { job_type: ChangesetJobType, reason: String },
}

/// One unit of a bulk operation: apply `job_type` to a single changeset.
///
/// `job_type` is kept as stored so rows written by newer producers still
/// load; it is validated when the operation is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetJob {
    pub bulk_group: String,
    pub batch_change_id: BatchChangeId,
    pub changeset_id: ChangesetId,
    pub user_id: UserId,
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Decoded bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOperation {
    Comment { message: String },
    Detach,
    Reenqueue,
    Merge { squash: bool },
}

#[derive(Deserialize)]
struct CommentPayload {
    message: String,
}

#[derive(Deserialize, Default)]
struct MergePayload {
    #[serde(default)]
    squash: bool,
}

impl ChangesetJob {
    pub fn operation(&self) -> Result<BulkOperation, InvalidJobType> {
        let job_type = ChangesetJobType::parse(&self.job_type)?;
        let payload_err = |e: serde_json::Error| InvalidJobType::Payload {
            job_type,
            reason: e.to_string(),
        };

        Ok(match job_type {
            ChangesetJobType::Comment => {
                let p: CommentPayload =
                    serde_json::from_value(self.payload.clone()).map_err(payload_err)?;
                BulkOperation::Comment { message: p.message }
            }
            ChangesetJobType::Detach => BulkOperation::Detach,
            ChangesetJobType::Reenqueue => BulkOperation::Reenqueue,
            ChangesetJobType::Merge => {
                let p: MergePayload = if self.payload.is_null() {
                    MergePayload::default()
                } else {
                    serde_json::from_value(self.payload.clone()).map_err(payload_err)?
                };
                BulkOperation::Merge { squash: p.squash }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(job_type: &str, payload: serde_json::Value) -> ChangesetJob {
        ChangesetJob {
            bulk_group: "group".into(),
            batch_change_id: BatchChangeId::new(1),
            changeset_id: ChangesetId::new(2),
            user_id: UserId::new(3),
            job_type: job_type.into(),
            payload,
        }
    }

    #[test]
    fn unknown_type_message_is_exact() {
        let err = job("UNKNOWN", json!({})).operation().unwrap_err();
        assert_eq!(err.to_string(), r#"invalid job type "UNKNOWN""#);
    }

    #[test]
    fn decodes_operations() {
        assert_eq!(
            job("comment", json!({"message": "hi"})).operation().unwrap(),
            BulkOperation::Comment { message: "hi".into() }
        );
        assert_eq!(job("detach", json!({})).operation().unwrap(), BulkOperation::Detach);
        assert_eq!(job("reenqueue", json!(null)).operation().unwrap(), BulkOperation::Reenqueue);
        assert_eq!(
            job("merge", json!({"squash": true})).operation().unwrap(),
            BulkOperation::Merge { squash: true }
        );
        assert_eq!(
            job("merge", json!(null)).operation().unwrap(),
            BulkOperation::Merge { squash: false }
        );
    }

    #[test]
    fn comment_requires_message() {
        let err = job("comment", json!({})).operation().unwrap_err();
        assert!(matches!(err, InvalidJobType::Payload { job_type: ChangesetJobType::Comment, .. }));
    }

    #[test]
    fn type_match_is_case_sensitive() {
        assert!(ChangesetJobType::parse("Comment").is_err());
    }
}
