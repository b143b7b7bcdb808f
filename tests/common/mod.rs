//! Shared harness for integration tests
//!
//! A `Harness` is one engine over one `MemoryStore`. A `Client` drains a
//! connection's delivery channel and rebuilds each subscription's value
//! from initial / delta / update messages, checking commit order as it
//! goes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use reflux::delivery::{DeliveryReceiver, ServerMessage};
use reflux::functions::FunctionRegistry;
use reflux::store::{CommitSeq, MemoryStore, Store};
use reflux::tracker::{canonical_json, QueryDescriptor};
use reflux::{ConnectionId, Engine, EngineConfig, SubscriptionId};

pub const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Engine harness
// =============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<Engine>,
}

impl Harness {
    /// Engine with built-in functions over a store seeded with tasks
    /// `a` (open) and `b` (closed).
    pub fn new() -> Self {
        Self::build(seeded_store(MemoryStore::default()), fast_config(), FunctionRegistry::with_builtins())
    }

    pub fn build(store: MemoryStore, config: EngineConfig, functions: FunctionRegistry) -> Self {
        let store = Arc::new(store);
        let engine = Arc::new(Engine::new(config, store.clone(), functions));
        engine.start().expect("engine start");
        Self { store, engine }
    }

    /// Wait until every commit so far has been applied.
    pub async fn settle(&self) {
        let head = self.store.head();
        tokio::time::timeout(WAIT, self.engine.wait_until_applied(head))
            .await
            .expect("scheduler did not catch up")
            .expect("scheduler stopped");
    }

    pub fn connect(&self) -> Client {
        Client::new(self.engine.connect().expect("connect"))
    }

    pub async fn subscribe(&self, client: &Client, descriptor: QueryDescriptor) -> SubscriptionId {
        self.engine
            .subscribe(client.connection(), descriptor, None)
            .await
            .expect("subscribe")
    }
}

/// Config with no debounce and quick reconnects.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.feed.debounce_ms = 0;
    config.feed.reconnect_initial_backoff_ms = 1;
    config.feed.reconnect_max_backoff_ms = 10;
    config
}

pub fn seeded_store(store: MemoryStore) -> MemoryStore {
    store
        .insert("tasks", "a", json!({"title": "write docs", "status": "open"}))
        .unwrap();
    store
        .insert("tasks", "b", json!({"title": "ship", "status": "closed"}))
        .unwrap();
    store
}

// =============================================================================
// Descriptors
// =============================================================================

pub fn open_tasks() -> QueryDescriptor {
    QueryDescriptor::new(
        "rows.filter",
        json!({"table": "tasks", "where": [{"field": "status", "op": "eq", "value": "open"}]}),
    )
}

pub fn count_open() -> QueryDescriptor {
    QueryDescriptor::new(
        "rows.count",
        json!({"table": "tasks", "where": [{"field": "status", "op": "eq", "value": "open"}]}),
    )
}

pub fn get_row(table: &str, key: &str) -> QueryDescriptor {
    QueryDescriptor::new("rows.get", json!({"table": table, "key": key}))
}

// =============================================================================
// Client
// =============================================================================

pub struct Client {
    rx: DeliveryReceiver,
    values: HashMap<SubscriptionId, Value>,
    seqs: HashMap<SubscriptionId, CommitSeq>,
    pub received: Vec<ServerMessage>,
}

impl Client {
    pub fn new(rx: DeliveryReceiver) -> Self {
        Self {
            rx,
            values: HashMap::new(),
            seqs: HashMap::new(),
            received: Vec::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.rx.connection()
    }

    pub fn receiver(&self) -> &DeliveryReceiver {
        &self.rx
    }

    /// Drain and apply everything queued. Panics if a subscription's
    /// results arrive out of commit order.
    pub fn pump(&mut self) -> Vec<ServerMessage> {
        let messages = self.rx.drain();
        for message in &messages {
            self.apply(message);
        }
        self.received.extend(messages.iter().cloned());
        messages
    }

    fn apply(&mut self, message: &ServerMessage) {
        let Some(id) = message.subscription_id() else {
            return;
        };
        if let Some(seq) = message.seq() {
            if let Some(previous) = self.seqs.get(&id) {
                let fresh_initial = matches!(message, ServerMessage::Initial { .. });
                assert!(
                    seq > *previous || (fresh_initial && seq >= *previous),
                    "subscription {} went from {} to {}",
                    id,
                    previous,
                    seq
                );
            }
            self.seqs.insert(id, seq);
        }

        match message {
            ServerMessage::Initial { value, .. } | ServerMessage::Update { value, .. } => {
                self.values.insert(id, (**value).clone());
            }
            ServerMessage::Delta { delta, .. } => {
                let old = self.values.get(&id).cloned().unwrap_or(Value::Null);
                self.values.insert(id, delta.apply(&old));
            }
            _ => {}
        }
    }

    pub fn value(&self, id: SubscriptionId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn last_seq(&self, id: SubscriptionId) -> Option<CommitSeq> {
        self.seqs.get(&id).copied()
    }

    /// Result-carrying messages for `id` received so far
    pub fn results_for(&self, id: SubscriptionId) -> Vec<&ServerMessage> {
        self.received
            .iter()
            .filter(|m| m.subscription_id() == Some(id) && m.seq().is_some())
            .collect()
    }
}

/// Equal as values, treating arrays as multisets.
pub fn same_result(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            let mut a: Vec<String> = a.iter().map(canonical_json).collect();
            let mut b: Vec<String> = b.iter().map(canonical_json).collect();
            a.sort();
            b.sort();
            a == b
        }
        _ => a == b,
    }
}

pub fn keys_of(rows: &Value) -> Vec<String> {
    let mut keys: Vec<String> = rows
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r["_key"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys
}
