//! # Query Context
//!
//! The only door a query function has onto the store. Every read goes
//! through here and is recorded; every write is refused.

use std::sync::Arc;

use serde_json::Value;

use super::errors::QueryError;
use super::filter::Filter;
use super::read_set::ReadSet;
use crate::store::{ChangeOp, CommitSeq, Snapshot};

/// Rows returned by table reads, ordered by primary key.
pub type Rows = Vec<(String, Arc<Value>)>;

pub struct QueryContext<'a> {
    snapshot: &'a dyn Snapshot,
    read_set: ReadSet,
    write_attempt: Option<(String, ChangeOp)>,
}

impl<'a> QueryContext<'a> {
    pub fn new(snapshot: &'a dyn Snapshot) -> Self {
        Self {
            snapshot,
            read_set: ReadSet::new(),
            write_attempt: None,
        }
    }

    /// Commit sequence number of the snapshot being read.
    pub fn seq(&self) -> CommitSeq {
        self.snapshot.seq()
    }

    /// Point read. A miss is still a dependency: the row may appear later.
    pub fn get(&mut self, table: &str, key: &str) -> Result<Option<Arc<Value>>, QueryError> {
        self.read_set.record_row(table, key);
        Ok(self.snapshot.get(table, key)?)
    }

    /// Rows of `table` matching `filter`.
    pub fn filter(&mut self, table: &str, filter: &Filter) -> Result<Rows, QueryError> {
        self.read_set.record_predicate(table, filter.fingerprint(table));
        let rows = self.snapshot.scan(table)?;
        Ok(rows
            .into_iter()
            .filter(|(_, row)| filter.matches(row))
            .collect())
    }

    /// Every row of `table`.
    pub fn scan(&mut self, table: &str) -> Result<Rows, QueryError> {
        self.filter(table, &Filter::all())
    }

    pub fn insert(&mut self, table: &str, _key: &str, _row: Value) -> Result<(), QueryError> {
        Err(self.refuse(table, ChangeOp::Insert))
    }

    pub fn update(&mut self, table: &str, _key: &str, _row: Value) -> Result<(), QueryError> {
        Err(self.refuse(table, ChangeOp::Update))
    }

    pub fn delete(&mut self, table: &str, _key: &str) -> Result<(), QueryError> {
        Err(self.refuse(table, ChangeOp::Delete))
    }

    // The attempt is remembered even if the function swallows the error.
    fn refuse(&mut self, table: &str, op: ChangeOp) -> QueryError {
        if self.write_attempt.is_none() {
            self.write_attempt = Some((table.to_string(), op));
        }
        QueryError::WriteAttempt {
            table: table.to_string(),
            op,
        }
    }

    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    /// Consume the context, yielding the read-set and the first refused write.
    pub fn into_parts(self) -> (ReadSet, Option<(String, ChangeOp)>) {
        (self.read_set, self.write_attempt)
    }
}
