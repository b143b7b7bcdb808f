//! # In-memory reference store
//!
//! Multi-version rows plus a retention-bounded change log.
//!
//! Every commit gets the next sequence number; all of its row changes become
//! visible atomically and share that number in the log. The log keeps the
//! most recent `log_retention` commits; reading from before the retained
//! window fails with `StoreError::Truncated`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::{
    ChangeEvent, ChangeLog, CommitSeq, Snapshot, Store, StoreError, StoreResult, Version, VersionChain,
};

/// Configuration for the in-memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Number of most recent commits kept in the change log
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
}

fn default_log_retention() -> usize {
    10_000
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            log_retention: default_log_retention(),
        }
    }
}

/// One row write inside a commit
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Insert { table: String, key: String, row: Value },
    Update { table: String, key: String, row: Value },
    Delete { table: String, key: String },
}

impl Write {
    pub fn insert(table: impl Into<String>, key: impl Into<String>, row: Value) -> Self {
        Write::Insert {
            table: table.into(),
            key: key.into(),
            row,
        }
    }

    pub fn update(table: impl Into<String>, key: impl Into<String>, row: Value) -> Self {
        Write::Update {
            table: table.into(),
            key: key.into(),
            row,
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Write::Delete {
            table: table.into(),
            key: key.into(),
        }
    }

    fn target(&self) -> (&str, &str) {
        match self {
            Write::Insert { table, key, .. }
            | Write::Update { table, key, .. }
            | Write::Delete { table, key } => (table.as_str(), key.as_str()),
        }
    }
}

#[derive(Debug)]
struct Inner {
    tables: HashMap<String, BTreeMap<String, VersionChain>>,
    log: VecDeque<ChangeEvent>,
    /// Number of distinct commits currently held in `log`
    log_commits: usize,
    /// Every commit `<= log_floor` has been pruned from the log
    log_floor: CommitSeq,
    head: CommitSeq,
}

impl Inner {
    fn latest(&self, table: &str, key: &str) -> Option<Arc<Value>> {
        self.tables.get(table)?.get(key)?.latest().cloned()
    }

    fn prune_oldest_commit(&mut self) {
        let Some(oldest) = self.log.front().map(|e| e.seq) else {
            return;
        };
        while self.log.front().is_some_and(|e| e.seq == oldest) {
            self.log.pop_front();
        }
        self.log_commits -= 1;
        self.log_floor = oldest;
    }
}

/// In-memory multi-version store with a change log.
#[derive(Debug)]
pub struct MemoryStore {
    config: MemoryStoreConfig,
    inner: Arc<RwLock<Inner>>,
    commits: watch::Sender<CommitSeq>,
    disconnected: AtomicBool,
    redeliver: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let (commits, _) = watch::channel(CommitSeq::ZERO);
        Self {
            config,
            inner: Arc::new(RwLock::new(Inner {
                tables: HashMap::new(),
                log: VecDeque::new(),
                log_commits: 0,
                log_floor: CommitSeq::ZERO,
                head: CommitSeq::ZERO,
            })),
            commits,
            disconnected: AtomicBool::new(false),
            redeliver: AtomicUsize::new(0),
        }
    }

    /// Commit a set of writes atomically.
    ///
    /// Writes are validated against the latest state (including earlier
    /// writes of the same commit) before anything is applied.
    pub fn commit(&self, writes: Vec<Write>) -> StoreResult<CommitSeq> {
        let seq = {
            let mut inner = self.inner.write();
            let seq = inner.head.next();
            let events = Self::stage(&inner, &writes, seq)?;
            if events.is_empty() {
                return Ok(inner.head);
            }

            for write in writes {
                match write {
                    Write::Insert { table, key, row } | Write::Update { table, key, row } => {
                        Self::chain_mut(&mut inner, table, key).push(Version::row(row, seq));
                    }
                    Write::Delete { table, key } => {
                        Self::chain_mut(&mut inner, table, key).push(Version::tombstone(seq));
                    }
                }
            }

            inner.head = seq;
            inner.log.extend(events);
            inner.log_commits += 1;
            while inner.log_commits > self.config.log_retention.max(1) {
                inner.prune_oldest_commit();
            }
            seq
        };

        self.commits.send_replace(seq);
        Ok(seq)
    }

    /// Validate writes and build their change events.
    fn stage(inner: &Inner, writes: &[Write], seq: CommitSeq) -> StoreResult<Vec<ChangeEvent>> {
        // Row images as they stand after the writes staged so far.
        let mut overlay: HashMap<(&str, &str), Option<Value>> = HashMap::new();
        let mut events = Vec::with_capacity(writes.len());

        for write in writes {
            let (table, key) = write.target();
            let current = match overlay.get(&(table, key)) {
                Some(staged) => staged.clone(),
                None => inner.latest(table, key).map(|row| (*row).clone()),
            };

            match write {
                Write::Insert { row, .. } => {
                    if current.is_some() {
                        return Err(StoreError::RowExists {
                            table: table.to_string(),
                            key: key.to_string(),
                        });
                    }
                    Self::check_row(table, key, row)?;
                    events.push(ChangeEvent::insert(seq, table, key, row));
                    overlay.insert((table, key), Some(row.clone()));
                }
                Write::Update { row, .. } => {
                    let Some(old) = current else {
                        return Err(StoreError::RowNotFound {
                            table: table.to_string(),
                            key: key.to_string(),
                        });
                    };
                    Self::check_row(table, key, row)?;
                    events.push(ChangeEvent::update(seq, table, key, &old, row));
                    overlay.insert((table, key), Some(row.clone()));
                }
                Write::Delete { .. } => {
                    let Some(old) = current else {
                        return Err(StoreError::RowNotFound {
                            table: table.to_string(),
                            key: key.to_string(),
                        });
                    };
                    events.push(ChangeEvent::delete(seq, table, key, &old));
                    overlay.insert((table, key), None);
                }
            }
        }

        Ok(events)
    }

    fn check_row(table: &str, key: &str, row: &Value) -> StoreResult<()> {
        if row.is_object() {
            Ok(())
        } else {
            Err(StoreError::InvalidRow {
                table: table.to_string(),
                key: key.to_string(),
            })
        }
    }

    fn chain_mut(inner: &mut Inner, table: String, key: String) -> &mut VersionChain {
        inner.tables.entry(table).or_default().entry(key).or_default()
    }

    pub fn insert(&self, table: &str, key: &str, row: Value) -> StoreResult<CommitSeq> {
        self.commit(vec![Write::insert(table, key, row)])
    }

    pub fn update(&self, table: &str, key: &str, row: Value) -> StoreResult<CommitSeq> {
        self.commit(vec![Write::update(table, key, row)])
    }

    pub fn delete(&self, table: &str, key: &str) -> StoreResult<CommitSeq> {
        self.commit(vec![Write::delete(table, key)])
    }

    /// Drop every commit `<= seq` from the change log (retention expiry).
    pub fn prune_log_through(&self, seq: CommitSeq) {
        let mut inner = self.inner.write();
        while inner.log.front().is_some_and(|e| e.seq <= seq) {
            inner.prune_oldest_commit();
        }
        if inner.log_floor < seq && seq <= inner.head {
            inner.log_floor = seq;
        }
    }

    /// Oldest commit still readable from the log.
    pub fn oldest_retained(&self) -> CommitSeq {
        self.inner.read().log_floor.next()
    }

    /// Simulate losing (or regaining) the change log connection.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
        if !disconnected {
            // Wake listeners so they retry promptly.
            let head = self.head();
            self.commits.send_replace(head);
        }
    }

    /// Make each read repeat up to `commits` already-consumed commits,
    /// emulating at-least-once delivery from the log.
    pub fn set_redelivery(&self, commits: usize) {
        self.redeliver.store(commits, Ordering::SeqCst);
    }
}

impl ChangeLog for MemoryStore {
    fn read_after(&self, after: CommitSeq, limit: usize) -> StoreResult<Vec<ChangeEvent>> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(StoreError::Disconnected("change log connection lost".to_string()));
        }

        let inner = self.inner.read();
        if after < inner.log_floor {
            return Err(StoreError::Truncated {
                requested: after,
                oldest: inner.log_floor.next(),
            });
        }

        let redeliver = self.redeliver.load(Ordering::SeqCst) as u64;
        let from = CommitSeq::new(after.value().saturating_sub(redeliver).max(inner.log_floor.value()));

        let mut events = Vec::new();
        let mut current: Option<CommitSeq> = None;
        for event in inner.log.iter().filter(|e| e.seq > from) {
            if current != Some(event.seq) {
                if events.len() >= limit.max(1) {
                    break;
                }
                current = Some(event.seq);
            }
            events.push(event.clone());
        }
        Ok(events)
    }

    fn watch_commits(&self) -> watch::Receiver<CommitSeq> {
        self.commits.subscribe()
    }
}

impl Store for MemoryStore {
    fn head(&self) -> CommitSeq {
        self.inner.read().head
    }

    fn snapshot_at(&self, seq: CommitSeq) -> StoreResult<Arc<dyn Snapshot>> {
        let head = self.head();
        if seq > head {
            return Err(StoreError::SnapshotUnavailable { requested: seq, head });
        }
        Ok(Arc::new(MemorySnapshot {
            inner: Arc::clone(&self.inner),
            seq,
        }))
    }
}

/// Snapshot over the shared version chains.
///
/// Chains are append-only, so reading them later still yields the state
/// as of `seq`.
struct MemorySnapshot {
    inner: Arc<RwLock<Inner>>,
    seq: CommitSeq,
}

impl Snapshot for MemorySnapshot {
    fn seq(&self) -> CommitSeq {
        self.seq
    }

    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Arc<Value>>> {
        let inner = self.inner.read();
        Ok(inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .and_then(|chain| chain.visible_at(self.seq))
            .cloned())
    }

    fn scan(&self, table: &str) -> StoreResult<Vec<(String, Arc<Value>)>> {
        let inner = self.inner.read();
        let Some(rows) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter_map(|(key, chain)| chain.visible_at(self.seq).map(|row| (key.clone(), Arc::clone(row))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeOp;
    use serde_json::json;

    #[test]
    fn test_commit_assigns_gap_free_sequence() {
        let store = MemoryStore::default();
        let s1 = store.insert("tasks", "a", json!({"n": 1})).unwrap();
        let s2 = store.insert("tasks", "b", json!({"n": 2})).unwrap();
        let s3 = store.update("tasks", "a", json!({"n": 3})).unwrap();

        assert_eq!(s1, CommitSeq::new(1));
        assert_eq!(s2, CommitSeq::new(2));
        assert_eq!(s3, CommitSeq::new(3));
        assert_eq!(store.head(), s3);
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = MemoryStore::default();
        let s1 = store.insert("tasks", "a", json!({"n": 1})).unwrap();
        store.update("tasks", "a", json!({"n": 2})).unwrap();
        store.delete("tasks", "a").unwrap();

        let old = store.snapshot_at(s1).unwrap();
        assert_eq!(old.get("tasks", "a").unwrap().unwrap()["n"], 1);

        let now = store.snapshot().unwrap();
        assert!(now.get("tasks", "a").unwrap().is_none());
        assert!(now.scan("tasks").unwrap().is_empty());
    }

    #[test]
    fn test_multi_write_commit_shares_sequence() {
        let store = MemoryStore::default();
        let seq = store
            .commit(vec![
                Write::insert("tasks", "a", json!({"n": 1})),
                Write::insert("tasks", "b", json!({"n": 2})),
                Write::update("tasks", "a", json!({"n": 5})),
            ])
            .unwrap();

        let events = store.read_after(CommitSeq::ZERO, 100).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.seq == seq));
        assert_eq!(events[2].op, ChangeOp::Update);

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.get("tasks", "a").unwrap().unwrap()["n"], 5);
    }

    #[test]
    fn test_invalid_commit_applies_nothing() {
        let store = MemoryStore::default();
        store.insert("tasks", "a", json!({"n": 1})).unwrap();

        let err = store
            .commit(vec![
                Write::insert("tasks", "b", json!({"n": 2})),
                Write::insert("tasks", "a", json!({"n": 3})),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::RowExists { .. }));
        assert_eq!(store.head(), CommitSeq::new(1));
        assert!(store.snapshot().unwrap().get("tasks", "b").unwrap().is_none());
    }

    #[test]
    fn test_read_after_never_splits_commits() {
        let store = MemoryStore::default();
        store
            .commit(vec![
                Write::insert("t", "a", json!({})),
                Write::insert("t", "b", json!({})),
            ])
            .unwrap();
        store.insert("t", "c", json!({})).unwrap();

        let events = store.read_after(CommitSeq::ZERO, 1).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.seq == CommitSeq::new(1)));
    }

    #[test]
    fn test_retention_truncates_log() {
        let store = MemoryStore::new(MemoryStoreConfig { log_retention: 2 });
        for i in 0..5 {
            store.insert("t", &i.to_string(), json!({})).unwrap();
        }

        assert_eq!(store.oldest_retained(), CommitSeq::new(4));
        assert!(store.read_after(CommitSeq::new(3), 10).is_ok());

        let err = store.read_after(CommitSeq::new(1), 10).unwrap_err();
        assert_eq!(
            err,
            StoreError::Truncated {
                requested: CommitSeq::new(1),
                oldest: CommitSeq::new(4),
            }
        );
    }

    #[test]
    fn test_disconnect_and_redelivery() {
        let store = MemoryStore::default();
        store.insert("t", "a", json!({})).unwrap();
        store.insert("t", "b", json!({})).unwrap();

        store.set_disconnected(true);
        assert!(store.read_after(CommitSeq::ZERO, 10).unwrap_err().is_transient());
        store.set_disconnected(false);

        store.set_redelivery(1);
        let events = store.read_after(CommitSeq::new(1), 10).unwrap();
        assert_eq!(events.first().map(|e| e.seq), Some(CommitSeq::new(1)));
    }

    #[test]
    fn test_snapshot_beyond_head_is_rejected() {
        let store = MemoryStore::default();
        assert!(matches!(
            store.snapshot_at(CommitSeq::new(1)),
            Err(StoreError::SnapshotUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_watch_observes_commits() {
        let store = MemoryStore::default();
        let mut rx = store.watch_commits();
        store.insert("t", "a", json!({})).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), CommitSeq::new(1));
    }
}
