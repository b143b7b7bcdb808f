//! # Built-in Query Functions
//!
//! Generic table readers usable without any application code:
//!
//! - `rows.get    {table, key}`               row or `null`
//! - `rows.filter {table, where?, limit?}`    array of rows, by key
//! - `rows.count  {table, where?}`            number of matching rows
//!
//! Returned rows carry their primary key under `_key`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::registry::FunctionRegistry;
use crate::tracker::{Filter, QueryContext, QueryError};

pub const ROWS_GET: &str = "rows.get";
pub const ROWS_FILTER: &str = "rows.filter";
pub const ROWS_COUNT: &str = "rows.count";

/// Field injected into returned rows holding the primary key
pub const KEY_FIELD: &str = "_key";

#[derive(Deserialize)]
struct GetArgs {
    table: String,
    key: String,
}

#[derive(Deserialize)]
struct FilterArgs {
    table: String,
    #[serde(default, rename = "where")]
    filter: Filter,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) fn install(registry: &mut FunctionRegistry) {
    // Names are fixed and the registry is fresh, so these cannot collide.
    let _ = registry.register_query(ROWS_GET, rows_get);
    let _ = registry.register_query(ROWS_FILTER, rows_filter);
    let _ = registry.register_query(ROWS_COUNT, rows_count);
}

fn parse<T: DeserializeOwned>(args: &Value) -> Result<T, QueryError> {
    T::deserialize(args).map_err(|e| QueryError::invalid_args(e.to_string()))
}

fn with_key(key: &str, row: &Arc<Value>) -> Value {
    match row.as_ref() {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert(KEY_FIELD.to_string(), Value::String(key.to_string()));
            Value::Object(fields)
        }
        other => json!({ KEY_FIELD: key, "value": other }),
    }
}

fn rows_get(ctx: &mut QueryContext<'_>, args: &Value) -> Result<Value, QueryError> {
    let args: GetArgs = parse(args)?;
    Ok(ctx
        .get(&args.table, &args.key)?
        .map(|row| with_key(&args.key, &row))
        .unwrap_or(Value::Null))
}

fn rows_filter(ctx: &mut QueryContext<'_>, args: &Value) -> Result<Value, QueryError> {
    let args: FilterArgs = parse(args)?;
    let rows = ctx.filter(&args.table, &args.filter)?;
    let limit = args.limit.unwrap_or(usize::MAX);
    Ok(Value::Array(
        rows.iter()
            .take(limit)
            .map(|(key, row)| with_key(key, row))
            .collect(),
    ))
}

fn rows_count(ctx: &mut QueryContext<'_>, args: &Value) -> Result<Value, QueryError> {
    let args: FilterArgs = parse(args)?;
    let rows = ctx.filter(&args.table, &args.filter)?;
    Ok(json!(rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};

    fn store() -> MemoryStore {
        let store = MemoryStore::default();
        store.insert("tasks", "a", json!({"status": "open", "rank": 2})).unwrap();
        store.insert("tasks", "b", json!({"status": "closed", "rank": 1})).unwrap();
        store.insert("tasks", "c", json!({"status": "open", "rank": 3})).unwrap();
        store
    }

    #[test]
    fn test_rows_get() {
        let store = store();
        let snapshot = store.snapshot().unwrap();
        let mut ctx = QueryContext::new(snapshot.as_ref());

        let row = rows_get(&mut ctx, &json!({"table": "tasks", "key": "a"})).unwrap();
        assert_eq!(row, json!({"status": "open", "rank": 2, "_key": "a"}));

        let missing = rows_get(&mut ctx, &json!({"table": "tasks", "key": "z"})).unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[test]
    fn test_rows_filter_and_limit() {
        let store = store();
        let snapshot = store.snapshot().unwrap();
        let mut ctx = QueryContext::new(snapshot.as_ref());

        let args = json!({
            "table": "tasks",
            "where": [{"field": "status", "op": "eq", "value": "open"}],
        });
        let rows = rows_filter(&mut ctx, &args).unwrap();
        let keys: Vec<&str> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["_key"].as_str().unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "c"]);

        let limited = rows_filter(&mut ctx, &json!({"table": "tasks", "limit": 1})).unwrap();
        assert_eq!(limited.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_rows_count() {
        let store = store();
        let snapshot = store.snapshot().unwrap();
        let mut ctx = QueryContext::new(snapshot.as_ref());

        let count = rows_count(
            &mut ctx,
            &json!({"table": "tasks", "where": [{"field": "rank", "op": "gte", "value": 2}]}),
        )
        .unwrap();
        assert_eq!(count, json!(2));
    }

    #[test]
    fn test_bad_args() {
        let store = store();
        let snapshot = store.snapshot().unwrap();
        let mut ctx = QueryContext::new(snapshot.as_ref());

        let err = rows_get(&mut ctx, &json!({"table": "tasks"})).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgs(_)));
    }
}
