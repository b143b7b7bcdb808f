//! # Store Errors

use thiserror::Error;

use super::CommitSeq;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a store implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The change log no longer retains the requested resume point
    #[error("change log truncated: requested commits after {requested}, oldest retained is {oldest}")]
    Truncated {
        requested: CommitSeq,
        oldest: CommitSeq,
    },

    /// The connection to the store was lost; the caller may retry
    #[error("store disconnected: {0}")]
    Disconnected(String),

    /// A snapshot beyond the store head was requested
    #[error("snapshot at {requested} unavailable (head is {head})")]
    SnapshotUnavailable { requested: CommitSeq, head: CommitSeq },

    /// Insert of a key that already exists
    #[error("row already exists: {table}/{key}")]
    RowExists { table: String, key: String },

    /// Update or delete of a key that does not exist
    #[error("row not found: {table}/{key}")]
    RowNotFound { table: String, key: String },

    /// Rows must be JSON objects
    #[error("invalid row for {table}/{key}: rows must be JSON objects")]
    InvalidRow { table: String, key: String },
}

impl StoreError {
    /// Transient errors are retried by the change feed listener
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Disconnected(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Truncated { .. } => "REFLUX_STORE_TRUNCATED",
            StoreError::Disconnected(_) => "REFLUX_STORE_DISCONNECTED",
            StoreError::SnapshotUnavailable { .. } => "REFLUX_STORE_SNAPSHOT_UNAVAILABLE",
            StoreError::RowExists { .. } => "REFLUX_STORE_ROW_EXISTS",
            StoreError::RowNotFound { .. } => "REFLUX_STORE_ROW_NOT_FOUND",
            StoreError::InvalidRow { .. } => "REFLUX_STORE_INVALID_ROW",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_disconnect_is_transient() {
        assert!(StoreError::Disconnected("reset".into()).is_transient());
        assert!(!StoreError::Truncated {
            requested: CommitSeq::new(1),
            oldest: CommitSeq::new(10),
        }
        .is_transient());
    }

    #[test]
    fn test_truncated_display() {
        let err = StoreError::Truncated {
            requested: CommitSeq::new(3),
            oldest: CommitSeq::new(9),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 3"));
        assert!(msg.contains("oldest retained is 9"));
    }
}
