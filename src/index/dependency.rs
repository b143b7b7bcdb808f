//! Dependency Index
//!
//! Maps data dependencies to the subscriptions that declared them.
//!
//! # API
//!
//! - `register(id, read_set)` - Install or replace a subscription's dependencies
//! - `unregister(id)` - Drop every entry for a subscription
//! - `affected(event)` - Subscriptions a change event may invalidate
//! - `affected_batch(events)` - Union over a batch
//!
//! # Structure
//!
//! - Point map: `(table, key) -> ids`, sharded by dependency hash, one lock
//!   per shard
//! - Predicate map: `table -> ids`, consulted only for tables that have
//!   predicate subscribers
//!
//! Predicate invalidation is coarse: any change to a table affects every
//! predicate subscriber of that table.
//!
//! # Replacement
//!
//! `register` adds the new entries before removing stale ones, so a
//! concurrent lookup sees either set or their union, never a gap.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, RwLock};

use crate::ids::SubscriptionId;
use crate::store::ChangeEvent;
use crate::tracker::{Dependency, ReadSet};

/// Default number of point-map shards
pub const DEFAULT_SHARDS: usize = 16;

type Subscribers = HashSet<SubscriptionId>;
type PointShard = HashMap<String, HashMap<String, Subscribers>>;

#[derive(Debug)]
pub struct DependencyIndex {
    points: Vec<RwLock<PointShard>>,
    predicates: RwLock<HashMap<String, Subscribers>>,
    /// Last registered read-set per subscription, sharded by id
    registered: Vec<Mutex<HashMap<SubscriptionId, ReadSet>>>,
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl DependencyIndex {
    /// Creates an empty index with `shards` point-map shards
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            points: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            predicates: RwLock::new(HashMap::new()),
            registered: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn point_shard(&self, table: &str, key: &str) -> &RwLock<PointShard> {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.points[hasher.finish() as usize % self.points.len()]
    }

    fn registered_shard(&self, id: SubscriptionId) -> &Mutex<HashMap<SubscriptionId, ReadSet>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.registered[hasher.finish() as usize % self.registered.len()]
    }

    /// Install `read_set` as the complete dependency set of `id`,
    /// replacing whatever was registered before.
    pub fn register(&self, id: SubscriptionId, read_set: ReadSet) {
        let mut registered = self.registered_shard(id).lock();
        let previous = registered.remove(&id).unwrap_or_default();

        {
            let old_predicate_tables = previous.predicate_tables();
            let new_predicate_tables = read_set.predicate_tables();

            for dep in read_set.iter().filter(|d| !previous.contains(d)) {
                if let Dependency::Row { table, key } = dep {
                    self.add_point(id, table, key);
                }
            }
            for table in new_predicate_tables.difference(&old_predicate_tables) {
                self.predicates
                    .write()
                    .entry((*table).to_string())
                    .or_default()
                    .insert(id);
            }

            for dep in previous.iter().filter(|d| !read_set.contains(d)) {
                if let Dependency::Row { table, key } = dep {
                    self.remove_point(id, table, key);
                }
            }
            for table in old_predicate_tables.difference(&new_predicate_tables) {
                self.remove_predicate(id, table);
            }
        }

        registered.insert(id, read_set);
    }

    /// Remove every entry for `id`. Returns whether anything was registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let Some(previous) = self.registered_shard(id).lock().remove(&id) else {
            return false;
        };

        for dep in previous.iter() {
            if let Dependency::Row { table, key } = dep {
                self.remove_point(id, table, key);
            }
        }
        for table in previous.predicate_tables() {
            self.remove_predicate(id, table);
        }
        true
    }

    /// Subscriptions whose dependencies `event` may touch.
    pub fn affected(&self, event: &ChangeEvent) -> HashSet<SubscriptionId> {
        let mut out = HashSet::new();
        self.collect_affected(event, &mut out);
        out
    }

    /// Union of `affected` over a batch.
    pub fn affected_batch(&self, events: &[ChangeEvent]) -> HashSet<SubscriptionId> {
        let mut out = HashSet::new();
        for event in events {
            self.collect_affected(event, &mut out);
        }
        out
    }

    fn collect_affected(&self, event: &ChangeEvent, out: &mut HashSet<SubscriptionId>) {
        {
            let shard = self.point_shard(&event.table, &event.key).read();
            if let Some(ids) = shard.get(&event.table).and_then(|keys| keys.get(&event.key)) {
                out.extend(ids.iter().copied());
            }
        }

        if let Some(ids) = self.predicates.read().get(&event.table) {
            out.extend(ids.iter().copied());
        }
    }

    /// The read-set currently registered for `id`.
    pub fn dependencies_of(&self, id: SubscriptionId) -> Option<ReadSet> {
        self.registered_shard(id).lock().get(&id).cloned()
    }

    /// Number of subscriptions with registered dependencies
    pub fn subscription_count(&self) -> usize {
        self.registered.iter().map(|s| s.lock().len()).sum()
    }

    /// Number of distinct `(table, key)` point entries
    pub fn point_count(&self) -> usize {
        self.points
            .iter()
            .map(|s| s.read().values().map(HashMap::len).sum::<usize>())
            .sum()
    }

    /// Number of tables with at least one predicate subscriber
    pub fn predicate_table_count(&self) -> usize {
        self.predicates.read().len()
    }

    fn add_point(&self, id: SubscriptionId, table: &str, key: &str) {
        self.point_shard(table, key)
            .write()
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(id);
    }

    fn remove_point(&self, id: SubscriptionId, table: &str, key: &str) {
        let mut shard = self.point_shard(table, key).write();
        let Some(keys) = shard.get_mut(table) else {
            return;
        };
        if let Some(ids) = keys.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                keys.remove(key);
            }
        }
        if keys.is_empty() {
            shard.remove(table);
        }
    }

    fn remove_predicate(&self, id: SubscriptionId, table: &str) {
        let mut predicates = self.predicates.write();
        if let Some(ids) = predicates.get_mut(table) {
            ids.remove(&id);
            if ids.is_empty() {
                predicates.remove(table);
            }
        }
    }
}
