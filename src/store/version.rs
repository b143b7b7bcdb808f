//! Row versions and snapshot visibility
//!
//! - A version is an immutable row image or an explicit tombstone
//! - Versions of one row form a chain ordered by commit sequence
//! - A snapshot at `S` sees, per row, the version with the largest
//!   sequence `<= S`; if that version is a tombstone the row is absent

use std::sync::Arc;

use serde_json::Value;

use super::CommitSeq;

/// Payload of a version: a row image or an explicit tombstone.
#[derive(Clone, Debug, PartialEq)]
pub enum VersionPayload {
    Row(Arc<Value>),
    Tombstone,
}

/// A single immutable row version.
#[derive(Clone, Debug, PartialEq)]
pub struct Version {
    payload: VersionPayload,
    seq: CommitSeq,
}

impl Version {
    pub fn row(row: Value, seq: CommitSeq) -> Self {
        Self {
            payload: VersionPayload::Row(Arc::new(row)),
            seq,
        }
    }

    pub fn tombstone(seq: CommitSeq) -> Self {
        Self {
            payload: VersionPayload::Tombstone,
            seq,
        }
    }

    #[inline]
    pub fn seq(&self) -> CommitSeq {
        self.seq
    }

    #[inline]
    pub fn payload(&self) -> &VersionPayload {
        &self.payload
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, VersionPayload::Tombstone)
    }
}

/// Version history of a single row, in commit order.
#[derive(Clone, Debug, Default)]
pub struct VersionChain {
    versions: Vec<Version>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a version. Callers append in commit order.
    pub fn push(&mut self, version: Version) {
        debug_assert!(self
            .versions
            .last()
            .map_or(true, |last| last.seq() < version.seq()));
        self.versions.push(version);
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Row image visible at `seq`, if any.
    pub fn visible_at(&self, seq: CommitSeq) -> Option<&Arc<Value>> {
        // Chains are sorted, so the last version within bound wins.
        let version = self.versions.iter().rev().find(|v| v.seq() <= seq)?;
        match version.payload() {
            VersionPayload::Row(row) => Some(row),
            VersionPayload::Tombstone => None,
        }
    }

    /// Row image at the head of the chain.
    pub fn latest(&self) -> Option<&Arc<Value>> {
        match self.versions.last()?.payload() {
            VersionPayload::Row(row) => Some(row),
            VersionPayload::Tombstone => None,
        }
    }
}
