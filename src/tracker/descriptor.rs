//! # Query Descriptors
//!
//! Identity of a live query: function reference plus canonically
//! serialized arguments. Immutable once built.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use super::hash::{canonical_json, ContentHash, Fingerprint};

#[derive(Clone, Debug)]
pub struct QueryDescriptor {
    function: String,
    args: Value,
    canonical_args: String,
    fingerprint: Fingerprint,
}

impl QueryDescriptor {
    pub fn new(function: impl Into<String>, args: Value) -> Self {
        let function = function.into();
        let canonical_args = canonical_json(&args);

        let mut identity = Vec::with_capacity(function.len() + canonical_args.len() + 1);
        identity.extend_from_slice(function.as_bytes());
        identity.push(0);
        identity.extend_from_slice(canonical_args.as_bytes());

        Self {
            fingerprint: ContentHash::of_bytes(&identity),
            function,
            args,
            canonical_args,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn canonical_args(&self) -> &str {
        &self.canonical_args
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl PartialEq for QueryDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function && self.canonical_args == other.canonical_args
    }
}

impl Eq for QueryDescriptor {}

impl Hash for QueryDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function, self.canonical_args)
    }
}
