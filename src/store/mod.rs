//! # Store Boundary
//!
//! The relational store is an external collaborator. The engine needs two
//! things from it:
//!
//! - **Snapshots**: read-only, consistent views keyed to a commit sequence
//!   number (`Snapshot`)
//! - **Change log**: a durable, ordered, resumable stream of row changes
//!   with explicit truncation signalling (`ChangeLog`)
//!
//! `MemoryStore` is the in-process reference implementation used by tests
//! and the demo server.

mod change;
mod commit;
mod errors;
mod memory;
mod version;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

pub use change::{changed_columns, ChangeEvent, ChangeOp};
pub use commit::CommitSeq;
pub use errors::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryStoreConfig, Write};
pub use version::{Version, VersionChain, VersionPayload};

/// A consistent read-only view of the store at one commit sequence number.
pub trait Snapshot: Send + Sync {
    /// Highest commit visible in this snapshot.
    fn seq(&self) -> CommitSeq;

    /// Point read by primary key.
    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Arc<Value>>>;

    /// Full table scan, ordered by primary key.
    fn scan(&self, table: &str) -> StoreResult<Vec<(String, Arc<Value>)>>;
}

/// Ordered, resumable change log.
///
/// Delivery is at-least-once: a read may repeat commits at or before
/// `after`. Commits are never split across reads.
pub trait ChangeLog: Send + Sync {
    /// Events of commits strictly after `after`, oldest first.
    ///
    /// Whole commits are returned until at least `limit` events have been
    /// collected. Fails with `StoreError::Truncated` when commits after
    /// `after` are no longer retained.
    fn read_after(&self, after: CommitSeq, limit: usize) -> StoreResult<Vec<ChangeEvent>>;

    /// Watch channel carrying the latest committed sequence number.
    fn watch_commits(&self) -> watch::Receiver<CommitSeq>;
}

/// A store: snapshots plus its change log.
pub trait Store: ChangeLog {
    /// Latest committed sequence number.
    fn head(&self) -> CommitSeq;

    /// Snapshot observing exactly the commits `1..=seq`.
    fn snapshot_at(&self, seq: CommitSeq) -> StoreResult<Arc<dyn Snapshot>>;

    /// Snapshot at the current head.
    fn snapshot(&self) -> StoreResult<Arc<dyn Snapshot>> {
        self.snapshot_at(self.head())
    }
}
