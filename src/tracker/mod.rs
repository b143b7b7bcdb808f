//! # Read-Set Tracker
//!
//! Executes a query function against a snapshot and records exactly which
//! rows and predicates it observed.
//!
//! Guarantees:
//! - A point read records a `Row` dependency whether or not the row exists
//! - A filter or scan records a `Predicate` dependency on the table
//! - Any write attempt fails the execution with `InvalidQueryEffect`,
//!   even when the function ignores the error it was handed
//! - A panicking function fails the execution; it never unwinds into
//!   the caller

mod context;
mod descriptor;
mod errors;
mod filter;
mod hash;
mod read_set;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

pub use context::{QueryContext, Rows};
pub use descriptor::QueryDescriptor;
pub use errors::{QueryError, TrackerError, TrackerResult};
pub use filter::{Condition, Filter, FilterOp};
pub use hash::{canonical_json, ContentHash, Fingerprint};
pub use read_set::{Dependency, ReadSet};

use crate::functions::{FunctionHandle, FunctionRegistry, QueryFunction};
use crate::store::{CommitSeq, Snapshot};

/// Outcome of one tracked execution
#[derive(Debug, Clone)]
pub struct Execution {
    /// Result value returned by the function
    pub result: Arc<Value>,
    /// Content hash of `result`
    pub hash: ContentHash,
    /// Dependencies observed while computing `result`
    pub read_set: ReadSet,
    /// Snapshot the execution ran against
    pub seq: CommitSeq,
}

/// Runs query functions under dependency tracking
#[derive(Debug, Clone)]
pub struct ReadSetTracker {
    functions: Arc<FunctionRegistry>,
}

impl ReadSetTracker {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Resolve the descriptor's function, refusing unknown names and
    /// mutations.
    pub fn validate(&self, descriptor: &QueryDescriptor) -> TrackerResult<Arc<dyn QueryFunction>> {
        match self.functions.get(descriptor.function()) {
            None => Err(TrackerError::UnknownFunction(
                descriptor.function().to_string(),
            )),
            Some(FunctionHandle::Mutation) => Err(TrackerError::InvalidQueryEffect {
                function: descriptor.function().to_string(),
                reason: "mutations cannot be subscribed to".to_string(),
            }),
            Some(FunctionHandle::Query(function)) => Ok(Arc::clone(function)),
        }
    }

    /// Execute `descriptor` against `snapshot`.
    pub fn execute(
        &self,
        descriptor: &QueryDescriptor,
        snapshot: &dyn Snapshot,
    ) -> TrackerResult<Execution> {
        let function = self.validate(descriptor)?;
        let name = descriptor.function();

        let mut ctx = QueryContext::new(snapshot);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            function.call(&mut ctx, descriptor.args())
        }));
        let (read_set, write_attempt) = ctx.into_parts();

        if let Some((table, op)) = write_attempt {
            return Err(TrackerError::InvalidQueryEffect {
                function: name.to_string(),
                reason: format!("attempted {} on table '{}'", op, table),
            });
        }

        let result = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(QueryError::Store(e))) => return Err(TrackerError::Store(e)),
            Ok(Err(e)) => {
                return Err(TrackerError::QueryFailed {
                    function: name.to_string(),
                    message: e.to_string(),
                })
            }
            Err(payload) => {
                return Err(TrackerError::QueryFailed {
                    function: name.to_string(),
                    message: format!("panicked: {}", panic_message(payload.as_ref())),
                })
            }
        };

        Ok(Execution {
            hash: ContentHash::of(&result),
            result: Arc::new(result),
            read_set,
            seq: snapshot.seq(),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
