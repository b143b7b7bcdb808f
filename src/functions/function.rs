//! # Function Handles

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tracker::{QueryContext, QueryError};

/// A read-only query function.
///
/// Implementations must be deterministic: the same snapshot and arguments
/// produce the same result and the same reads.
pub trait QueryFunction: Send + Sync {
    fn call(&self, ctx: &mut QueryContext<'_>, args: &Value) -> Result<Value, QueryError>;
}

impl<F> QueryFunction for F
where
    F: Fn(&mut QueryContext<'_>, &Value) -> Result<Value, QueryError> + Send + Sync,
{
    fn call(&self, ctx: &mut QueryContext<'_>, args: &Value) -> Result<Value, QueryError> {
        self(ctx, args)
    }
}

/// What a registered function is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Query,
    Mutation,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::Query => write!(f, "query"),
            FunctionKind::Mutation => write!(f, "mutation"),
        }
    }
}

/// A resolved function reference.
///
/// Mutations are declared by name only; they run in the write path, never
/// inside the engine, and are refused as subscription targets.
#[derive(Clone)]
pub enum FunctionHandle {
    Query(Arc<dyn QueryFunction>),
    Mutation,
}

impl FunctionHandle {
    pub fn kind(&self) -> FunctionKind {
        match self {
            FunctionHandle::Query(_) => FunctionKind::Query,
            FunctionHandle::Mutation => FunctionKind::Mutation,
        }
    }

    pub fn as_query(&self) -> Option<&Arc<dyn QueryFunction>> {
        match self {
            FunctionHandle::Query(f) => Some(f),
            FunctionHandle::Mutation => None,
        }
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionHandle::{}", self.kind())
    }
}
