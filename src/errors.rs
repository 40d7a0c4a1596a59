// src/errors.rs

//! Crate-wide error types and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskloomError {
    /// An operation was attempted in a state that does not allow it
    /// (e.g. restarting a process that is currently running).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required linked entity is missing or an input is structurally
    /// invalid (e.g. a workflow without a starting node).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Bounded wait for a named mutex elapsed without acquisition.
    #[error("timed out waiting for lock '{0}'")]
    LockTimeout(String),

    /// A runner raised during `prepare` or `execute`. The failure is
    /// classified before it is wrapped; lifecycle timestamps are always
    /// recorded before this is returned to the caller.
    #[error("runner execution failed: {source}")]
    Execution {
        retryable: bool,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskloomError {
    /// Whether the error is eligible for the retry machinery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskloomError::Execution { retryable: true, .. })
    }
}

/// Marker for transient infrastructure failures. Runners wrap flaky-IO
/// errors in this so the default classifier can tell them apart from
/// permanent business-rule violations.
#[derive(Error, Debug)]
#[error("transient failure: {0}")]
pub struct TransientFailure(pub String);

pub type Result<T> = std::result::Result<T, TaskloomError>;
