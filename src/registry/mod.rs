//! # Subscription Registry
//!
//! Owns every live subscription and the connections hosting them.
//!
//! ## Invariants
//! - A subscription exists only while its connection is open
//! - Removing a subscription marks it removed under its own lock before
//!   its dependency entries are dropped, so a racing recompute can never
//!   re-register it
//! - `unsubscribe` is idempotent
//! - Identical descriptors on different connections are independent

mod subscription;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub use subscription::{Subscription, SubscriptionState};

use crate::delivery::{DeliveryError, DeliverySender, ServerMessage};
use crate::errors::{EngineError, EngineResult};
use crate::ids::{ConnectionId, SubscriptionId};
use crate::index::DependencyIndex;
use crate::observability::{Event, MetricsRegistry};
use crate::store::Store;
use crate::tracker::{QueryDescriptor, ReadSetTracker};

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Subscriptions one connection may hold at once
    pub max_subscriptions_per_connection: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
        }
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: DeliverySender,
    subscriptions: HashSet<SubscriptionId>,
}

/// Registry of live subscriptions
pub struct SubscriptionRegistry {
    config: RegistryConfig,
    store: Arc<dyn Store>,
    tracker: ReadSetTracker,
    index: Arc<DependencyIndex>,
    metrics: Arc<MetricsRegistry>,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new(
        config: RegistryConfig,
        store: Arc<dyn Store>,
        tracker: ReadSetTracker,
        index: Arc<DependencyIndex>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            tracker,
            index,
            metrics,
            subscriptions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &ReadSetTracker {
        &self.tracker
    }

    pub fn index(&self) -> &Arc<DependencyIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Register an open connection.
    pub fn register_connection(&self, sender: DeliverySender) {
        let connection = sender.connection();
        self.connections.write().insert(
            connection,
            ConnectionEntry {
                sender,
                subscriptions: HashSet::new(),
            },
        );
        info!(event = %Event::ConnectionOpened, connection = %connection);
    }

    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.connections.read().contains_key(&connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn sender(&self, connection: ConnectionId) -> Option<DeliverySender> {
        self.connections
            .read()
            .get(&connection)
            .map(|entry| entry.sender.clone())
    }

    /// Create a subscription: execute once against the current snapshot,
    /// register its dependencies and queue `subscribed` plus the initial
    /// snapshot on the connection.
    ///
    /// Runs the query on the calling thread.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        descriptor: QueryDescriptor,
        request_id: Option<String>,
    ) -> EngineResult<Arc<Subscription>> {
        let sender = self.check_capacity(connection)?;

        let snapshot = self.store.snapshot()?;
        let execution = self.tracker.execute(&descriptor, snapshot.as_ref())?;

        let id = SubscriptionId::new();
        let subscription = Arc::new(Subscription::new(id, descriptor, sender, execution));

        {
            let state = subscription.lock();
            let mut connections = self.connections.write();
            let entry = connections
                .get_mut(&connection)
                .ok_or(EngineError::UnknownConnection(connection))?;
            let limit = self.config.max_subscriptions_per_connection;
            if entry.subscriptions.len() >= limit {
                return Err(EngineError::TooManySubscriptions { connection, limit });
            }

            self.index.register(id, state.read_set.clone());
            entry.subscriptions.insert(id);
            self.subscriptions.write().insert(id, Arc::clone(&subscription));
            drop(connections);

            let sender = subscription.sender();
            let queued = sender
                .send(ServerMessage::Subscribed {
                    request_id: request_id.clone(),
                    subscription_id: id,
                    function: subscription.descriptor().function().to_string(),
                })
                .and_then(|_| {
                    sender.send_initial(id, request_id, state.watermark, Arc::clone(&state.result))
                });

            if let Err(e) = queued {
                drop(state);
                self.remove(id);
                if matches!(e, DeliveryError::Overflow { .. }) {
                    self.close_overflowed(connection);
                }
                return Err(e.into());
            }
        }

        self.metrics.increment_subscriptions_created();
        info!(
            event = %Event::SubscriptionCreated,
            subscription = %id,
            connection = %connection,
            query = %subscription.descriptor(),
            seq = %subscription.watermark()
        );
        Ok(subscription)
    }

    fn check_capacity(&self, connection: ConnectionId) -> EngineResult<DeliverySender> {
        let connections = self.connections.read();
        let entry = connections
            .get(&connection)
            .ok_or(EngineError::UnknownConnection(connection))?;
        let limit = self.config.max_subscriptions_per_connection;
        if entry.subscriptions.len() >= limit {
            return Err(EngineError::TooManySubscriptions { connection, limit });
        }
        Ok(entry.sender.clone())
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove(id)
    }

    /// Tear down a connection and every subscription it hosts.
    /// Returns the number of subscriptions removed.
    pub fn on_connection_closed(&self, connection: ConnectionId) -> usize {
        self.detach(connection).unwrap_or(0)
    }

    /// Tear down a connection whose channel failed with `DeliveryOverflow`.
    /// Returns `None` if it was already closed.
    pub fn close_overflowed(&self, connection: ConnectionId) -> Option<usize> {
        let removed = self.detach(connection)?;
        self.metrics.increment_overflows();
        error!(
            event = %Event::DeliveryOverflow,
            connection = %connection,
            subscriptions = removed
        );
        Some(removed)
    }

    /// Queue a non-result message on a connection. An overflow closes the
    /// connection. Returns whether the message was queued.
    pub fn send(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        let Some(sender) = self.sender(connection) else {
            return false;
        };
        match sender.send(message) {
            Ok(_) => true,
            Err(DeliveryError::Overflow { .. }) => {
                self.close_overflowed(connection);
                false
            }
            Err(DeliveryError::Closed(_)) => false,
        }
    }

    fn detach(&self, connection: ConnectionId) -> Option<usize> {
        let entry = self.connections.write().remove(&connection)?;
        entry.sender.close();

        let removed = entry
            .subscriptions
            .iter()
            .filter(|id| self.remove(**id))
            .count();

        info!(
            event = %Event::ConnectionClosed,
            connection = %connection,
            subscriptions = removed
        );
        Some(removed)
    }

    /// Close every connection.
    pub fn close_all(&self) -> usize {
        let connections: Vec<ConnectionId> = self.connections.read().keys().copied().collect();
        connections
            .into_iter()
            .map(|c| self.on_connection_closed(c))
            .sum()
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.subscriptions.write().remove(&id) else {
            return false;
        };
        if !subscription.mark_removed() {
            return false;
        }
        self.index.unregister(id);

        if let Some(entry) = self.connections.write().get_mut(&subscription.connection()) {
            entry.subscriptions.remove(&id);
        }

        self.metrics.increment_subscriptions_removed();
        debug!(event = %Event::SubscriptionRemoved, subscription = %id);
        true
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Subscriptions hosted by `connection`
    pub fn by_connection(&self, connection: ConnectionId) -> Vec<Arc<Subscription>> {
        let ids: Vec<SubscriptionId> = match self.connections.read().get(&connection) {
            Some(entry) => entry.subscriptions.iter().copied().collect(),
            None => return Vec::new(),
        };
        let subscriptions = self.subscriptions.read();
        ids.iter().filter_map(|id| subscriptions.get(id).cloned()).collect()
    }

    /// Resolve ids to live subscriptions, skipping removed ones
    pub fn resolve(&self, ids: &HashSet<SubscriptionId>) -> Vec<Arc<Subscription>> {
        let subscriptions = self.subscriptions.read();
        ids.iter().filter_map(|id| subscriptions.get(id).cloned()).collect()
    }

    /// Every live subscription
    pub fn snapshot_all(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().values().cloned().collect()
    }

    /// Subscriptions whose last recompute failed
    pub fn degraded(&self) -> Vec<Arc<Subscription>> {
        self.snapshot_all()
            .into_iter()
            .filter(|s| s.is_degraded())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{channel, CloseReason, DeliveryConfig, DeliveryReceiver};
    use crate::functions::FunctionRegistry;
    use crate::store::MemoryStore;
    use crate::tracker::Dependency;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: SubscriptionRegistry,
    }

    fn fixture(limit: usize) -> Fixture {
        let store = Arc::new(MemoryStore::default());
        store.insert("tasks", "a", json!({"status": "open"})).unwrap();
        let registry = SubscriptionRegistry::new(
            RegistryConfig {
                max_subscriptions_per_connection: limit,
            },
            store.clone(),
            ReadSetTracker::new(Arc::new(FunctionRegistry::with_builtins())),
            Arc::new(DependencyIndex::default()),
            Arc::new(MetricsRegistry::new()),
        );
        Fixture { store, registry }
    }

    fn connect(registry: &SubscriptionRegistry) -> (ConnectionId, DeliveryReceiver) {
        let (tx, rx) = channel(ConnectionId::new(), DeliveryConfig::default());
        let id = tx.connection();
        registry.register_connection(tx);
        (id, rx)
    }

    fn get_a() -> QueryDescriptor {
        QueryDescriptor::new("rows.get", json!({"table": "tasks", "key": "a"}))
    }

    #[test]
    fn test_subscribe_delivers_initial() {
        let f = fixture(10);
        let (conn, mut rx) = connect(&f.registry);

        let sub = f.registry.subscribe(conn, get_a(), Some("r1".into())).unwrap();
        assert_eq!(sub.result()["status"], "open");
        assert_eq!(sub.watermark(), f.store.head());
        assert!(f
            .registry
            .index()
            .dependencies_of(sub.id())
            .unwrap()
            .contains(&Dependency::row("tasks", "a")));

        let messages = rx.drain();
        assert!(matches!(&messages[0], ServerMessage::Subscribed { request_id: Some(r), .. } if r == "r1"));
        assert!(matches!(&messages[1], ServerMessage::Initial { subscription_id, .. } if *subscription_id == sub.id()));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let f = fixture(10);
        let (conn, _rx) = connect(&f.registry);
        let sub = f.registry.subscribe(conn, get_a(), None).unwrap();

        assert!(f.registry.unsubscribe(sub.id()));
        assert!(!f.registry.unsubscribe(sub.id()));
        assert!(sub.is_removed());
        assert_eq!(f.registry.index().subscription_count(), 0);
        assert!(f.registry.by_connection(conn).is_empty());
    }

    #[test]
    fn test_connection_close_cascades() {
        let f = fixture(10);
        let (conn, rx) = connect(&f.registry);
        let (other, _other_rx) = connect(&f.registry);
        f.registry.subscribe(conn, get_a(), None).unwrap();
        f.registry.subscribe(conn, get_a(), None).unwrap();
        let survivor = f.registry.subscribe(other, get_a(), None).unwrap();

        assert_eq!(f.registry.on_connection_closed(conn), 2);
        assert_eq!(f.registry.on_connection_closed(conn), 0);
        assert_eq!(f.registry.len(), 1);
        assert!(f.registry.contains(survivor.id()));
        assert_eq!(f.registry.index().subscription_count(), 1);
        assert!(rx.close_reason().is_some());
    }

    #[test]
    fn test_identical_descriptors_are_independent() {
        let f = fixture(10);
        let (c1, _rx1) = connect(&f.registry);
        let (c2, _rx2) = connect(&f.registry);
        let s1 = f.registry.subscribe(c1, get_a(), None).unwrap();
        let s2 = f.registry.subscribe(c2, get_a(), None).unwrap();
        assert_ne!(s1.id(), s2.id());

        f.registry.unsubscribe(s1.id());
        assert!(f.registry.contains(s2.id()));
    }

    #[test]
    fn test_subscription_limit() {
        let f = fixture(1);
        let (conn, _rx) = connect(&f.registry);
        f.registry.subscribe(conn, get_a(), None).unwrap();
        let err = f.registry.subscribe(conn, get_a(), None).unwrap_err();
        assert_eq!(err.code(), "REFLUX_TOO_MANY_SUBSCRIPTIONS");
    }

    #[test]
    fn test_unknown_function_rejected() {
        let f = fixture(10);
        let (conn, mut rx) = connect(&f.registry);
        let err = f
            .registry
            .subscribe(conn, QueryDescriptor::new("nope", json!({})), None)
            .unwrap_err();
        assert_eq!(err.code(), "REFLUX_UNKNOWN_FUNCTION");
        assert!(f.registry.is_empty());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_unknown_connection() {
        let f = fixture(10);
        let err = f
            .registry
            .subscribe(ConnectionId::new(), get_a(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownConnection(_)));
    }

    fn connect_tight(registry: &SubscriptionRegistry) -> (ConnectionId, DeliveryReceiver) {
        let config = DeliveryConfig {
            soft_bound: 1,
            hard_ceiling: 2,
            overflow_grace_ms: 0,
        };
        let (tx, rx) = channel(ConnectionId::new(), config);
        let id = tx.connection();
        registry.register_connection(tx);
        (id, rx)
    }

    #[test]
    fn test_overflow_on_subscribe_closes_connection() {
        let f = fixture(10);
        let (conn, rx) = connect_tight(&f.registry);
        let first = f.registry.subscribe(conn, get_a(), None).unwrap();

        let err = f.registry.subscribe(conn, get_a(), None).unwrap_err();
        assert_eq!(err.code(), "REFLUX_DELIVERY_OVERFLOW");

        assert_eq!(rx.close_reason(), Some(CloseReason::Overflow));
        assert!(!f.registry.has_connection(conn));
        assert!(!f.registry.contains(first.id()));
        assert!(first.is_removed());
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.index().subscription_count(), 0);
        assert_eq!(f.registry.metrics().overflows(), 1);
    }

    #[test]
    fn test_send_overflow_closes_connection() {
        let f = fixture(10);
        let (conn, _rx) = connect_tight(&f.registry);
        let sub = f.registry.subscribe(conn, get_a(), None).unwrap();

        assert!(!f.registry.send(conn, ServerMessage::heartbeat(None)));
        assert!(!f.registry.has_connection(conn));
        assert!(!f.registry.contains(sub.id()));
        assert_eq!(f.registry.metrics().overflows(), 1);

        // Already closed: nothing queued, nothing counted twice.
        assert!(!f.registry.send(conn, ServerMessage::heartbeat(None)));
        assert_eq!(f.registry.close_overflowed(conn), None);
        assert_eq!(f.registry.metrics().overflows(), 1);
    }
}
