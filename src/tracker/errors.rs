//! # Tracker Errors

use thiserror::Error;

use crate::store::{ChangeOp, StoreError};

/// Result type for tracked executions
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Error returned by query functions through `QueryContext`
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The function tried to write while running as a query
    #[error("{op} on table '{table}' is not allowed inside a query")]
    WriteAttempt { table: String, op: ChangeOp },

    /// Snapshot read failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Arguments did not match what the function expects
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Any other function-level failure
    #[error("{0}")]
    Failed(String),
}

impl QueryError {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        QueryError::InvalidArgs(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        QueryError::Failed(message.into())
    }
}

/// Error from one tracked execution
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// Descriptor names no registered function
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The function is not a read-only query, or attempted a write
    #[error("invalid query effect in '{function}': {reason}")]
    InvalidQueryEffect { function: String, reason: String },

    /// The function returned an error or panicked
    #[error("query '{function}' failed: {message}")]
    QueryFailed { function: String, message: String },

    /// Snapshot access failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TrackerError {
    pub fn code(&self) -> &'static str {
        match self {
            TrackerError::UnknownFunction(_) => "REFLUX_UNKNOWN_FUNCTION",
            TrackerError::InvalidQueryEffect { .. } => "REFLUX_INVALID_QUERY_EFFECT",
            TrackerError::QueryFailed { .. } => "REFLUX_QUERY_FAILED",
            TrackerError::Store(e) => e.code(),
        }
    }
}
