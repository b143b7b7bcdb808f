//! # Read-Sets
//!
//! The set of data dependencies one query execution observed.

use std::collections::BTreeSet;

use super::hash::Fingerprint;

/// An abstract predicate over store state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    /// Point read of one primary key (hit or miss)
    Row { table: String, key: String },
    /// Range/filter read over a table, identified by filter fingerprint
    Predicate { table: String, fingerprint: Fingerprint },
}

impl Dependency {
    pub fn row(table: impl Into<String>, key: impl Into<String>) -> Self {
        Dependency::Row {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn predicate(table: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Dependency::Predicate {
            table: table.into(),
            fingerprint,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Dependency::Row { table, .. } | Dependency::Predicate { table, .. } => table,
        }
    }

    pub fn is_predicate(&self) -> bool {
        matches!(self, Dependency::Predicate { .. })
    }
}

/// Dependencies observed by one execution, deduplicated and ordered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadSet {
    deps: BTreeSet<Dependency>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dependency: Dependency) -> bool {
        self.deps.insert(dependency)
    }

    pub fn record_row(&mut self, table: &str, key: &str) {
        self.insert(Dependency::row(table, key));
    }

    pub fn record_predicate(&mut self, table: &str, fingerprint: Fingerprint) {
        self.insert(Dependency::predicate(table, fingerprint));
    }

    pub fn contains(&self, dependency: &Dependency) -> bool {
        self.deps.contains(dependency)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter()
    }

    /// Tables this read-set holds predicate dependencies on.
    pub fn predicate_tables(&self) -> BTreeSet<&str> {
        self.deps
            .iter()
            .filter(|d| d.is_predicate())
            .map(Dependency::table)
            .collect()
    }
}

impl FromIterator<Dependency> for ReadSet {
    fn from_iter<I: IntoIterator<Item = Dependency>>(iter: I) -> Self {
        Self {
            deps: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ReadSet {
    type Item = &'a Dependency;
    type IntoIter = std::collections::btree_set::Iter<'a, Dependency>;

    fn into_iter(self) -> Self::IntoIter {
        self.deps.iter()
    }
}
