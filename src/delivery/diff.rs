//! # Result Deltas
//!
//! Array results are diffed as multisets keyed by the canonical encoding of
//! each element. Any other shape is sent as a full replacement.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tracker::canonical_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    /// Elements added to and removed from an array result
    Diff {
        inserts: Vec<Value>,
        deletes: Vec<Value>,
    },
    /// Full replacement value
    Replace { value: Value },
}

impl Delta {
    /// Compute the delta taking `old` to `new`.
    pub fn between(old: &Value, new: &Value) -> Self {
        match (old, new) {
            (Value::Array(old), Value::Array(new)) => Delta::Diff {
                inserts: multiset_minus(new, old),
                deletes: multiset_minus(old, new),
            },
            _ => Delta::Replace { value: new.clone() },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Delta::Diff { inserts, deletes } if inserts.is_empty() && deletes.is_empty())
    }

    /// Apply to a previous value. Array results come back equal as
    /// multisets: surviving elements keep their order, inserts go last.
    pub fn apply(&self, old: &Value) -> Value {
        match (self, old) {
            (Delta::Replace { value }, _) => value.clone(),
            (Delta::Diff { inserts, deletes }, Value::Array(items)) => {
                let mut pending = counts(deletes);
                let mut out: Vec<Value> = items
                    .iter()
                    .filter(|item| !take(&mut pending, &canonical_json(item)))
                    .cloned()
                    .collect();
                out.extend(inserts.iter().cloned());
                Value::Array(out)
            }
            (Delta::Diff { inserts, .. }, _) => Value::Array(inserts.clone()),
        }
    }
}

/// Elements of `a` not matched by an equal element of `b`, in `a` order.
fn multiset_minus(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut available = counts(b);
    a.iter()
        .filter(|item| !take(&mut available, &canonical_json(item)))
        .cloned()
        .collect()
}

fn counts(items: &[Value]) -> HashMap<String, usize> {
    let mut counts = HashMap::with_capacity(items.len());
    for item in items {
        *counts.entry(canonical_json(item)).or_insert(0) += 1;
    }
    counts
}

fn take(counts: &mut HashMap<String, usize>, key: &str) -> bool {
    match counts.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}
