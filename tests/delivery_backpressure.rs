//! Delivery Backpressure Tests
//!
//! A slow connection first has its pending results coalesced to the latest
//! value, then, if its queue keeps growing past the hard ceiling, is closed
//! with an overflow. Other connections are unaffected.

mod common;

use serde_json::{json, Value};

use common::{fast_config, get_row, seeded_store, Harness};
use reflux::delivery::{CloseReason, ServerMessage};
use reflux::functions::FunctionRegistry;
use reflux::store::{MemoryStore, Store};
use reflux::tracker::{QueryContext, QueryDescriptor, QueryError};

// =============================================================================
// Coalescing
// =============================================================================

/// A client that never reads holds one merged result, carrying the latest
/// value and sequence number.
#[tokio::test]
async fn test_unread_results_collapse_to_latest() {
    let store = MemoryStore::default();
    store.insert("counters", "c", json!({"n": 0})).unwrap();
    let mut config = fast_config();
    config.delivery.soft_bound = 2;
    let h = Harness::build(store, config, FunctionRegistry::with_builtins());

    let mut client = h.connect();
    let id = h.subscribe(&client, get_row("counters", "c")).await;

    for n in 1..=20 {
        h.store.update("counters", "c", json!({"n": n})).unwrap();
        h.settle().await;
    }

    let messages = client.pump();
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[0], ServerMessage::Subscribed { .. }));
    assert!(matches!(messages[1], ServerMessage::Initial { .. }));
    assert_eq!(client.value(id).unwrap()["n"], 20);
    assert_eq!(client.last_seq(id), Some(h.store.head()));
    assert_eq!(h.engine.metrics().deltas_coalesced, 20);
}

/// Below the soft bound nothing is merged.
#[tokio::test]
async fn test_no_coalescing_below_soft_bound() {
    let h = Harness::new();
    let mut client = h.connect();
    let id = h.subscribe(&client, get_row("tasks", "a")).await;

    for i in 0..5 {
        h.store
            .update("tasks", "a", json!({"status": "open", "rev": i}))
            .unwrap();
        h.settle().await;
    }

    client.pump();
    assert_eq!(client.results_for(id).len(), 6);
    assert_eq!(h.engine.metrics().deltas_coalesced, 0);
}

// =============================================================================
// Overflow
// =============================================================================

fn failing_functions() -> FunctionRegistry {
    let mut functions = FunctionRegistry::with_builtins();
    functions
        .register_query("tasks.fragile", |ctx: &mut QueryContext<'_>, _args: &Value| {
            match ctx.get("tasks", "a")? {
                Some(row) if row["broken"] == true => Err(QueryError::failed("task a is broken")),
                Some(row) => Ok((*row).clone()),
                None => Ok(Value::Null),
            }
        })
        .unwrap();
    functions
}

/// Error messages are never coalesced, so a client that stops reading
/// while its query keeps failing overflows and is disconnected. A client
/// that keeps reading stays connected.
#[tokio::test]
async fn test_overflow_closes_only_the_slow_connection() {
    let mut config = fast_config();
    config.delivery.soft_bound = 2;
    config.delivery.hard_ceiling = 3;
    config.delivery.overflow_grace_ms = 0;
    config.scheduler.max_consecutive_failures = 100;
    let h = Harness::build(seeded_store(MemoryStore::default()), config, failing_functions());

    let slow = h.connect();
    let mut fast = h.connect();
    let slow_id = h.subscribe(&slow, QueryDescriptor::new("tasks.fragile", Value::Null)).await;
    let fast_id = h.subscribe(&fast, QueryDescriptor::new("tasks.fragile", Value::Null)).await;
    fast.pump();

    for i in 0..2 {
        h.store
            .update("tasks", "a", json!({"status": "open", "broken": true, "try": i}))
            .unwrap();
        h.settle().await;
        fast.pump();
    }

    assert_eq!(slow.receiver().close_reason(), Some(CloseReason::Overflow));
    assert!(!h.engine.registry().has_connection(slow.connection()));
    assert!(!h.engine.registry().contains(slow_id));
    assert!(h.engine.registry().index().dependencies_of(slow_id).is_none());
    assert_eq!(h.engine.metrics().overflows, 1);

    assert!(h.engine.registry().has_connection(fast.connection()));
    assert!(h.engine.registry().contains(fast_id));
    let errors = fast
        .received
        .iter()
        .filter(|m| matches!(m, ServerMessage::Error { .. }))
        .count();
    assert_eq!(errors, 2);
}
