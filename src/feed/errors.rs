//! Change feed error types
//!
//! Only `Gap` is global: it forces a full resync. Everything else is
//! either retried inside the listener or reported to the caller.

use thiserror::Error;

use crate::store::{CommitSeq, StoreError};

/// Result type for feed operations
pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Events after `after` cannot be delivered in order: the log was
    /// truncated or skipped ahead to `next_available`
    #[error("change feed gap after {after}: next available commit is {next_available}")]
    Gap {
        after: CommitSeq,
        next_available: CommitSeq,
    },

    /// Non-transient store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Gave up reconnecting
    #[error("change log unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    /// Checkpoint could not be read or written
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: String, message: String },

    /// Checkpoint exists but failed validation
    #[error("checkpoint {path} is corrupted: {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    /// The store's commit notifications stopped
    #[error("change feed closed")]
    Closed,
}

impl FeedError {
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::Gap { .. } => "REFLUX_FEED_GAP",
            FeedError::Store(e) => e.code(),
            FeedError::Unreachable { .. } => "REFLUX_FEED_UNREACHABLE",
            FeedError::Checkpoint { .. } => "REFLUX_CHECKPOINT_FAILED",
            FeedError::CheckpointCorrupted { .. } => "REFLUX_CHECKPOINT_CORRUPTED",
            FeedError::Closed => "REFLUX_FEED_CLOSED",
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, FeedError::Gap { .. })
    }

    pub(crate) fn checkpoint(path: &std::path::Path, message: impl Into<String>) -> Self {
        FeedError::Checkpoint {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn corrupted(path: &std::path::Path, reason: impl Into<String>) -> Self {
        FeedError::CheckpointCorrupted {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_code() {
        let err = FeedError::Gap {
            after: CommitSeq::new(3),
            next_available: CommitSeq::new(9),
        };
        assert!(err.is_gap());
        assert_eq!(err.code(), "REFLUX_FEED_GAP");
        assert!(err.to_string().contains("after 3"));
    }

    #[test]
    fn test_store_code_passthrough() {
        let err = FeedError::from(StoreError::Disconnected("x".into()));
        assert!(!err.is_gap());
        assert_eq!(err.code(), "REFLUX_STORE_DISCONNECTED");
    }
}
