//! # Change Events
//!
//! Row-level change records produced by the store's change log.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CommitSeq;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// New row inserted
    Insert,
    /// Existing row replaced
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "INSERT"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// A committed row-level change.
///
/// All events of one commit share its sequence number; the change log
/// always hands them out together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Commit sequence number
    pub seq: CommitSeq,

    /// Table name
    pub table: String,

    /// Primary key of the changed row
    pub key: String,

    /// Operation
    pub op: ChangeOp,

    /// Columns whose value changed (all columns for insert/delete)
    pub changed_columns: Vec<String>,

    /// Commit timestamp
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an INSERT event
    pub fn insert(seq: CommitSeq, table: impl Into<String>, key: impl Into<String>, row: &Value) -> Self {
        Self {
            seq,
            table: table.into(),
            key: key.into(),
            op: ChangeOp::Insert,
            changed_columns: columns_of(row),
            committed_at: Utc::now(),
        }
    }

    /// Create an UPDATE event
    pub fn update(
        seq: CommitSeq,
        table: impl Into<String>,
        key: impl Into<String>,
        old_row: &Value,
        new_row: &Value,
    ) -> Self {
        Self {
            seq,
            table: table.into(),
            key: key.into(),
            op: ChangeOp::Update,
            changed_columns: changed_columns(old_row, new_row),
            committed_at: Utc::now(),
        }
    }

    /// Create a DELETE event
    pub fn delete(seq: CommitSeq, table: impl Into<String>, key: impl Into<String>, old_row: &Value) -> Self {
        Self {
            seq,
            table: table.into(),
            key: key.into(),
            op: ChangeOp::Delete,
            changed_columns: columns_of(old_row),
            committed_at: Utc::now(),
        }
    }
}

fn columns_of(row: &Value) -> Vec<String> {
    match row.as_object() {
        Some(map) => map.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect(),
        None => Vec::new(),
    }
}

/// Columns whose values differ between two row images, sorted.
pub fn changed_columns(old_row: &Value, new_row: &Value) -> Vec<String> {
    let (Some(old), Some(new)) = (old_row.as_object(), new_row.as_object()) else {
        return columns_of(new_row);
    };

    old.keys()
        .chain(new.keys())
        .filter(|column| old.get(*column) != new.get(*column))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
