//! # Function Registry
//!
//! The closed set of functions a deployment exposes. Built once before the
//! engine starts and shared read-only behind an `Arc` afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::builtin;
use super::errors::{FunctionError, FunctionResult};
use super::function::{FunctionHandle, FunctionKind, QueryFunction};
use crate::tracker::{QueryContext, QueryError};

/// Registry of callable functions, by name
#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionHandle>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `rows.get`, `rows.filter` and `rows.count`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::install(&mut registry);
        registry
    }

    /// Register a query function given as a closure
    pub fn register_query<F>(&mut self, name: &str, function: F) -> FunctionResult<()>
    where
        F: Fn(&mut QueryContext<'_>, &Value) -> Result<Value, QueryError> + Send + Sync + 'static,
    {
        self.register(name, FunctionHandle::Query(Arc::new(function)))
    }

    /// Register a query function given as a trait object
    pub fn register_query_fn(
        &mut self,
        name: &str,
        function: Arc<dyn QueryFunction>,
    ) -> FunctionResult<()> {
        self.register(name, FunctionHandle::Query(function))
    }

    /// Declare a mutation. Subscribing to it is refused.
    pub fn declare_mutation(&mut self, name: &str) -> FunctionResult<()> {
        self.register(name, FunctionHandle::Mutation)
    }

    /// Register a handle under `name`
    pub fn register(&mut self, name: &str, handle: FunctionHandle) -> FunctionResult<()> {
        if name.trim().is_empty() {
            return Err(FunctionError::InvalidName(name.to_string()));
        }
        if self.functions.contains_key(name) {
            return Err(FunctionError::AlreadyExists(name.to_string()));
        }
        self.functions.insert(name.to_string(), handle);
        Ok(())
    }

    /// Resolve a function by name
    pub fn get(&self, name: &str) -> Option<&FunctionHandle> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Names and kinds, sorted by name
    pub fn list(&self) -> Vec<(&str, FunctionKind)> {
        self.functions
            .iter()
            .map(|(name, handle)| (name.as_str(), handle.kind()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = FunctionRegistry::new();
        registry
            .register_query("answer", |_ctx: &mut QueryContext<'_>, _args: &Value| Ok(json!(42)))
            .unwrap();
        registry.declare_mutation("tasks.create").unwrap();

        assert_eq!(registry.get("answer").unwrap().kind(), FunctionKind::Query);
        assert_eq!(
            registry.get("tasks.create").unwrap().kind(),
            FunctionKind::Mutation
        );
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = FunctionRegistry::with_builtins();
        let err = registry.declare_mutation("rows.get").unwrap_err();
        assert_eq!(err, FunctionError::AlreadyExists("rows.get".into()));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = FunctionRegistry::new();
        assert!(matches!(
            registry.declare_mutation("  "),
            Err(FunctionError::InvalidName(_))
        ));
    }

    #[test]
    fn test_builtins_listed() {
        let registry = FunctionRegistry::with_builtins();
        let names: Vec<&str> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["rows.count", "rows.filter", "rows.get"]);
    }
}
