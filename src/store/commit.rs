//! CommitSeq - Totally ordered commit sequence number
//!
//! - Totally orders all commits of one store
//! - Monotonically increasing and gap-free
//! - Independent of wall-clock time
//!
//! Sequence zero means "before the first commit" and is never assigned.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A commit sequence number.
///
/// Every change event and every snapshot is keyed by one. Snapshots at
/// sequence `n` observe exactly the commits `1..=n`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSeq(u64);

impl CommitSeq {
    /// The position before any commit.
    pub const ZERO: CommitSeq = CommitSeq(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The sequence number immediately following this one.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_seq_ordering() {
        let a = CommitSeq::new(5);
        let b = CommitSeq::new(6);
        assert!(a < b);
        assert_eq!(a.next(), b);
    }

    #[test]
    fn test_zero_is_before_everything() {
        assert!(CommitSeq::ZERO.is_zero());
        assert!(CommitSeq::ZERO < CommitSeq::new(1));
    }

    #[test]
    fn test_commit_seq_is_transparent_in_json() {
        let json = serde_json::to_string(&CommitSeq::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
