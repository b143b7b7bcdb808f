//! # Functions
//!
//! Query and mutation handles resolved by name. The engine only ever
//! executes queries; mutations are known so they can be refused.

pub mod builtin;
pub mod errors;
pub mod function;
pub mod registry;

pub use errors::{FunctionError, FunctionResult};
pub use function::{FunctionHandle, FunctionKind, QueryFunction};
pub use registry::FunctionRegistry;
