//! # Change Feed
//!
//! Consumes the store's change log in commit order, dedups redelivered
//! commits, reconnects on transient failure and persists a resume point.

mod checkpoint;
mod errors;
mod listener;

pub use checkpoint::{CheckpointStore, FileCheckpoint, MemoryCheckpoint};
pub use errors::{FeedError, FeedResult};
pub use listener::{ChangeBatch, ChangeFeedListener, FeedConfig};
