//! Domain error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, illegal transitions). Storage and
/// transport failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. an empty work-key).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state transition was attempted from a status that does not allow it.
    #[error("cannot {action} a job in status {from}")]
    InvalidTransition {
        from: JobStatus,
        action: &'static str,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(from: JobStatus, action: &'static str) -> Self {
        Self::InvalidTransition { from, action }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
