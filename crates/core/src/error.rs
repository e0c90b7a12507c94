//! Errors raised while parsing batch-changes values.

use thiserror::Error;

/// A stored or submitted value that does not fit its domain type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A textual value outside the type's vocabulary, such as an unknown
    /// reconciler state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier that is not a valid row id.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
