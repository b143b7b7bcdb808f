//! # Row Filters
//!
//! Conjunctive predicates evaluated by `QueryContext::filter`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::hash::{ContentHash, Fingerprint};

/// Filter operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

/// One `field op value` condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Field to filter on
    pub field: String,
    /// Operator
    pub op: FilterOp,
    /// Value to compare
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Check if a row satisfies this condition. Missing fields never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field_value) = row.get(&self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => field_value == &self.value,
            FilterOp::Neq => field_value != &self.value,
            FilterOp::Gt => compare(field_value, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(field_value, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(field_value, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(field_value, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(field_value)),
        }
    }
}

/// Numbers compare numerically, strings lexicographically; anything else
/// is incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Conjunction of conditions. The empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Filter matching all rows
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Builder: add `field == value`
    pub fn eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(Condition::new(field, FilterOp::Eq, value));
        self
    }

    /// Builder: add an arbitrary condition
    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Identity of this predicate over `table`.
    pub fn fingerprint(&self, table: &str) -> Fingerprint {
        let conditions = serde_json::to_value(&self.conditions).unwrap_or(Value::Null);
        ContentHash::of(&json!({ "table": table, "where": conditions }))
    }
}
