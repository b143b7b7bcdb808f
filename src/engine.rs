//! # Engine
//!
//! Wires the store, tracker, dependency index, registry, scheduler and
//! delivery channels together. One `Engine` per process; its handle is
//! passed explicitly to whatever needs it.
//!
//! Lifecycle:
//! 1. `Engine::new` builds every component
//! 2. `start` opens the change feed listener and spawns the scheduler loop
//! 3. `connect` / `subscribe` / `unsubscribe` / `close_connection` serve
//!    clients
//! 4. `shutdown` stops the scheduler and closes every connection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::delivery::{self, DeliveryReceiver, ServerMessage};
use crate::errors::{EngineError, EngineResult};
use crate::feed::{ChangeFeedListener, CheckpointStore, FileCheckpoint, MemoryCheckpoint};
use crate::functions::FunctionRegistry;
use crate::ids::{ConnectionId, SubscriptionId};
use crate::index::DependencyIndex;
use crate::observability::{log_event, Event, MetricsRegistry, MetricsSnapshot};
use crate::registry::SubscriptionRegistry;
use crate::scheduler::RecomputeScheduler;
use crate::store::{CommitSeq, Store};
use crate::tracker::{QueryDescriptor, ReadSetTracker};

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    checkpoint: Arc<dyn CheckpointStore>,
    registry: Arc<SubscriptionRegistry>,
    scheduler: Arc<RecomputeScheduler>,
    metrics: Arc<MetricsRegistry>,
    shutdown: watch::Sender<bool>,
    stopping: AtomicBool,
    task: Mutex<Option<JoinHandle<EngineResult<()>>>>,
}

impl Engine {
    /// Build an engine. The checkpoint is a file when
    /// `config.checkpoint_path` is set, in memory otherwise.
    pub fn new(config: EngineConfig, store: Arc<dyn Store>, functions: FunctionRegistry) -> Self {
        let checkpoint: Arc<dyn CheckpointStore> = match &config.checkpoint_path {
            Some(path) => Arc::new(FileCheckpoint::new(path)),
            None => Arc::new(MemoryCheckpoint::new()),
        };
        Self::with_checkpoint(config, store, functions, checkpoint)
    }

    pub fn with_checkpoint(
        config: EngineConfig,
        store: Arc<dyn Store>,
        functions: FunctionRegistry,
        checkpoint: Arc<dyn CheckpointStore>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            config.registry.clone(),
            Arc::clone(&store),
            ReadSetTracker::new(Arc::new(functions)),
            Arc::new(DependencyIndex::default()),
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(RecomputeScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&registry),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            checkpoint,
            registry,
            scheduler,
            metrics,
            shutdown,
            stopping: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Open the change feed and spawn the scheduler loop. Must run inside
    /// a tokio runtime. A listener with no checkpoint starts at the
    /// current store head.
    pub fn start(&self) -> EngineResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        info!(event = %Event::BootStart, head = %self.store.head());

        let listener = ChangeFeedListener::open(
            Arc::clone(&self.store),
            Arc::clone(&self.checkpoint),
            self.config.feed.clone(),
            self.store.head(),
        )?;
        let resume = listener.acknowledged();

        let scheduler = Arc::clone(&self.scheduler);
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let result = scheduler.run(listener, shutdown).await;
            if let Err(e) = &result {
                error!(code = e.code(), error = %e, "scheduler stopped");
            }
            result
        }));

        info!(event = %Event::BootComplete, resume = %resume);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<RecomputeScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Open a connection; the receiver is its outbound message stream.
    pub fn connect(&self) -> EngineResult<DeliveryReceiver> {
        self.ensure_running()?;
        let (sender, receiver) = delivery::channel(ConnectionId::new(), self.config.delivery.clone());
        self.registry.register_connection(sender);
        Ok(receiver)
    }

    /// Queue a non-result message on `connection`. A connection whose
    /// queue overflows is closed. Returns whether the message was queued.
    pub fn send(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        self.registry.send(connection, message)
    }

    /// Subscribe `connection` to `descriptor`.
    ///
    /// `subscribed` and the initial snapshot are queued on the connection
    /// before this returns. Failures are returned to the caller; nothing
    /// is queued for a rejected request. An overflow while queueing closes
    /// the whole connection.
    ///
    /// If commits landed after the initial snapshot, the subscription is
    /// refreshed at the current head before this returns. A failed refresh
    /// leaves it degraded for the next batch to retry; the subscription
    /// itself stands.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        descriptor: QueryDescriptor,
        request_id: Option<String>,
    ) -> EngineResult<SubscriptionId> {
        self.ensure_running()?;

        let registry = Arc::clone(&self.registry);
        let function = descriptor.function().to_string();
        let created = tokio::task::spawn_blocking(move || {
            registry.subscribe(connection, descriptor, request_id)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("subscribe task failed: {}", e)))?;

        let subscription = match created {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(
                    event = %Event::SubscriptionRejected,
                    connection = %connection,
                    function = %function,
                    code = e.code(),
                    error = %e
                );
                return Err(e);
            }
        };

        // Commits that landed between the initial execution and index
        // registration were resolved without this subscription.
        if self.store.head() > subscription.watermark() {
            if let Err(e) = self.scheduler.refresh(Arc::clone(&subscription)).await {
                warn!(
                    event = %Event::SubscriptionDegraded,
                    subscription = %subscription.id(),
                    code = e.code(),
                    error = %e,
                    "catch-up refresh failed"
                );
                subscription.lock().degraded = true;
            }
        }
        Ok(subscription.id())
    }

    /// Remove a subscription owned by `connection` and acknowledge it.
    /// Unknown or already removed ids are acknowledged too.
    pub fn unsubscribe(&self, connection: ConnectionId, subscription_id: SubscriptionId) -> bool {
        let removed = match self.registry.get(subscription_id) {
            Some(subscription) if subscription.connection() == connection => {
                self.registry.unsubscribe(subscription_id)
            }
            _ => false,
        };
        self.registry
            .send(connection, ServerMessage::Unsubscribed { subscription_id });
        removed
    }

    /// Close a connection and tear down its subscriptions.
    pub fn close_connection(&self, connection: ConnectionId) -> usize {
        self.registry.on_connection_closed(connection)
    }

    /// Wait until the scheduler has applied every commit up to `seq`.
    ///
    /// Only change feed batches count. The catch-up refresh in `subscribe`
    /// is finished when `subscribe` returns and never moves this mark.
    pub async fn wait_until_applied(&self, seq: CommitSeq) -> EngineResult<()> {
        self.scheduler.wait_until_applied(seq).await
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some() && !self.stopping.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Stop the scheduler and close every connection.
    pub async fn shutdown(&self) -> EngineResult<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log_event(Event::ShutdownStart);

        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        let result = match task {
            Some(task) => task
                .await
                .map_err(|e| EngineError::Internal(format!("scheduler task failed: {}", e)))
                .and_then(|r| r),
            None => Ok(()),
        };

        let closed = self.registry.close_all();
        info!(
            event = %Event::ShutdownComplete,
            subscriptions = closed,
            applied = %self.scheduler.applied()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeEvent, ChangeLog, MemoryStore, Snapshot, StoreError, StoreResult};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    fn engine() -> (Arc<MemoryStore>, Engine) {
        let store = Arc::new(MemoryStore::default());
        store.insert("tasks", "a", json!({"status": "open"})).unwrap();
        let mut config = EngineConfig::default();
        config.feed.debounce_ms = 0;
        let engine = Engine::new(config, store.clone(), FunctionRegistry::with_builtins());
        (store, engine)
    }

    #[tokio::test]
    async fn test_subscribe_then_update() {
        let (store, engine) = engine();
        engine.start().unwrap();
        let mut rx = engine.connect().unwrap();
        let conn = rx.connection();

        let id = engine
            .subscribe(
                conn,
                QueryDescriptor::new("rows.get", json!({"table": "tasks", "key": "a"})),
                Some("r1".into()),
            )
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ServerMessage::Subscribed { .. })));
        assert!(matches!(rx.recv().await, Some(ServerMessage::Initial { .. })));

        let seq = store.update("tasks", "a", json!({"status": "closed"})).unwrap();
        tokio::time::timeout(Duration::from_secs(5), engine.wait_until_applied(seq))
            .await
            .unwrap()
            .unwrap();
        match rx.recv().await {
            Some(ServerMessage::Delta {
                subscription_id,
                seq: delivered,
                ..
            }) => {
                assert_eq!(subscription_id, id);
                assert_eq!(delivered, seq);
            }
            other => panic!("expected delta, got {:?}", other),
        }

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_acknowledges_and_is_idempotent() {
        let (_store, engine) = engine();
        let mut rx = engine.connect().unwrap();
        let conn = rx.connection();
        let id = engine
            .subscribe(
                conn,
                QueryDescriptor::new("rows.count", json!({"table": "tasks"})),
                None,
            )
            .await
            .unwrap();
        rx.drain();

        assert!(engine.unsubscribe(conn, id));
        assert!(!engine.unsubscribe(conn, id));
        let acks = rx.drain();
        assert_eq!(acks.len(), 2);
        assert!(acks
            .iter()
            .all(|m| matches!(m, ServerMessage::Unsubscribed { subscription_id } if *subscription_id == id)));
    }

    #[tokio::test]
    async fn test_foreign_subscription_not_removed() {
        let (_store, engine) = engine();
        let owner = engine.connect().unwrap();
        let other = engine.connect().unwrap();
        let id = engine
            .subscribe(
                owner.connection(),
                QueryDescriptor::new("rows.count", json!({"table": "tasks"})),
                None,
            )
            .await
            .unwrap();

        assert!(!engine.unsubscribe(other.connection(), id));
        assert!(engine.registry().contains(id));
    }

    #[tokio::test]
    async fn test_rejected_subscription() {
        let (_store, engine) = engine();
        let mut rx = engine.connect().unwrap();
        let err = engine
            .subscribe(rx.connection(), QueryDescriptor::new("missing", json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REFLUX_UNKNOWN_FUNCTION");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (_store, engine) = engine();
        engine.start().unwrap();
        let rx = engine.connect().unwrap();
        engine
            .subscribe(
                rx.connection(),
                QueryDescriptor::new("rows.count", json!({"table": "tasks"})),
                None,
            )
            .await
            .unwrap();

        engine.shutdown().await.unwrap();
        assert!(engine.registry().is_empty());
        assert!(rx.close_reason().is_some());
        assert!(matches!(engine.connect(), Err(EngineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_overflow_on_subscribe_closes_connection() {
        let store = Arc::new(MemoryStore::default());
        store.insert("tasks", "a", json!({"status": "open"})).unwrap();
        let mut config = EngineConfig::default();
        config.delivery.soft_bound = 1;
        config.delivery.hard_ceiling = 2;
        config.delivery.overflow_grace_ms = 0;
        let engine = Engine::new(config, store, FunctionRegistry::with_builtins());

        let rx = engine.connect().unwrap();
        let conn = rx.connection();
        let count = QueryDescriptor::new("rows.count", json!({"table": "tasks"}));
        let first = engine.subscribe(conn, count.clone(), None).await.unwrap();

        let err = engine.subscribe(conn, count, None).await.unwrap_err();
        assert_eq!(err.code(), "REFLUX_DELIVERY_OVERFLOW");

        assert_eq!(rx.close_reason(), Some(delivery::CloseReason::Overflow));
        assert!(!engine.registry().has_connection(conn));
        assert!(!engine.registry().contains(first));
        assert!(engine.registry().is_empty());
        assert_eq!(engine.registry().index().subscription_count(), 0);
        assert_eq!(engine.metrics().overflows, 1);
        assert!(!engine.send(conn, ServerMessage::heartbeat(None)));
    }

    #[tokio::test]
    async fn test_unsubscribe_ack_overflow_closes_connection() {
        let store = Arc::new(MemoryStore::default());
        let mut config = EngineConfig::default();
        config.delivery.soft_bound = 1;
        config.delivery.hard_ceiling = 2;
        config.delivery.overflow_grace_ms = 0;
        let engine = Engine::new(config, store, FunctionRegistry::with_builtins());

        let rx = engine.connect().unwrap();
        let conn = rx.connection();
        let count = QueryDescriptor::new("rows.count", json!({"table": "tasks"}));
        let first = engine.subscribe(conn, count, None).await.unwrap();

        // Nothing read: the ack is the third queued message.
        assert!(engine.unsubscribe(conn, first));

        assert_eq!(rx.close_reason(), Some(delivery::CloseReason::Overflow));
        assert!(!engine.registry().has_connection(conn));
        assert_eq!(engine.registry().index().subscription_count(), 0);
        assert_eq!(engine.metrics().overflows, 1);
    }

    enum Scripted {
        /// Serve the commit before the requested one.
        Lag,
        Fail,
    }

    /// A memory store whose next snapshots follow a script.
    struct ScriptedStore {
        inner: MemoryStore,
        script: Mutex<VecDeque<Scripted>>,
    }

    impl ScriptedStore {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                inner: MemoryStore::default(),
                script: Mutex::new(script.into()),
            }
        }
    }

    impl ChangeLog for ScriptedStore {
        fn read_after(&self, after: CommitSeq, limit: usize) -> StoreResult<Vec<ChangeEvent>> {
            self.inner.read_after(after, limit)
        }

        fn watch_commits(&self) -> watch::Receiver<CommitSeq> {
            self.inner.watch_commits()
        }
    }

    impl Store for ScriptedStore {
        fn head(&self) -> CommitSeq {
            self.inner.head()
        }

        fn snapshot_at(&self, seq: CommitSeq) -> StoreResult<Arc<dyn Snapshot>> {
            match self.script.lock().pop_front() {
                Some(Scripted::Lag) => self
                    .inner
                    .snapshot_at(CommitSeq::new(seq.value().saturating_sub(1))),
                Some(Scripted::Fail) => Err(StoreError::SnapshotUnavailable {
                    requested: seq,
                    head: self.inner.head(),
                }),
                None => self.inner.snapshot_at(seq),
            }
        }
    }

    fn scripted_engine(script: Vec<Scripted>) -> (Arc<ScriptedStore>, Engine) {
        let store = Arc::new(ScriptedStore::new(script));
        store.inner.insert("tasks", "a", json!({"status": "open"})).unwrap();
        store.inner.update("tasks", "a", json!({"status": "closed"})).unwrap();
        let engine = Engine::new(EngineConfig::default(), store.clone(), FunctionRegistry::with_builtins());
        (store, engine)
    }

    #[tokio::test]
    async fn test_failed_catch_up_refresh_degrades() {
        let (store, engine) = scripted_engine(vec![Scripted::Lag, Scripted::Fail]);
        let mut rx = engine.connect().unwrap();
        let conn = rx.connection();

        let id = engine
            .subscribe(
                conn,
                QueryDescriptor::new("rows.get", json!({"table": "tasks", "key": "a"})),
                Some("r1".into()),
            )
            .await
            .unwrap();

        let subscription = engine.registry().get(id).unwrap();
        assert!(subscription.is_degraded());
        assert!(subscription.watermark() < store.head());
        assert!(engine.registry().degraded().iter().any(|s| s.id() == id));

        let messages = rx.drain();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ServerMessage::Subscribed { .. }));
        assert!(matches!(messages[1], ServerMessage::Initial { .. }));
    }

    #[tokio::test]
    async fn test_catch_up_refresh_done_before_subscribe_returns() {
        let (store, engine) = scripted_engine(vec![Scripted::Lag]);
        let mut rx = engine.connect().unwrap();

        let id = engine
            .subscribe(
                rx.connection(),
                QueryDescriptor::new("rows.get", json!({"table": "tasks", "key": "a"})),
                None,
            )
            .await
            .unwrap();

        // Not started: the applied mark never moved.
        assert_eq!(engine.scheduler().applied(), CommitSeq::ZERO);
        let subscription = engine.registry().get(id).unwrap();
        assert_eq!(subscription.watermark(), store.head());
        assert_eq!(subscription.result()["status"], "closed");

        let messages = rx.drain();
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[1], ServerMessage::Initial { .. }));
        assert!(matches!(messages[2], ServerMessage::Delta { seq, .. } if seq == store.head()));
    }
}
