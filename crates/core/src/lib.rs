//! `batchforge-core` - identifiers, execution log entries and the domain error type.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod execution;
pub mod id;

pub use error::DomainError;
pub use execution::ExecutionLogEntry;
pub use id::{
    BatchChangeId, BatchSpecId, ChangesetId, ChangesetSpecId, RepoId, UserId, WorkspaceId,
};
