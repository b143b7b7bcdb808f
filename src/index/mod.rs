//! Dependency Index subsystem
//!
//! Derived, in-memory-only state: which subscriptions depend on which rows
//! and tables. Rebuilt from the registry's read-sets, never persisted.
//!
//! # Invariants
//!
//! - Entries for a subscription equal its most recently registered read-set
//! - Unregistering removes every entry for that subscription

mod dependency;

pub use dependency::{DependencyIndex, DEFAULT_SHARDS};
