//! Per-type repair policies.

use super::registry::bare_type_name;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// How missing top-level fields of one schema may be repaired.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaPolicy {
    /// Fields that must come from the backend; no default is derived
    pub required: BTreeSet<String>,
    /// Explicit replacement values, applied before any derived default
    pub default_overrides: Map<String, Value>,
    /// Whether a missing field without override may get a type default
    pub allow_missing: bool,
}

impl Default for SchemaPolicy {
    fn default() -> Self {
        Self {
            required: BTreeSet::new(),
            default_overrides: Map::new(),
            allow_missing: true,
        }
    }
}

impl SchemaPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.insert(field.into());
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.default_overrides.insert(field.into(), value);
        self
    }

    pub fn allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }
}

/// Policies keyed by type name.
///
/// Lookup tries the full type path first, then the bare type name, and
/// falls back to [`SchemaPolicy::default`].
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: DashMap<String, SchemaPolicy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy for `T` under its full type path
    pub fn set_policy<T: 'static>(&self, policy: SchemaPolicy) {
        self.set_policy_by_name(std::any::type_name::<T>(), policy);
    }

    /// Register a policy under an arbitrary name, usually a bare type name
    pub fn set_policy_by_name(&self, name: impl Into<String>, policy: SchemaPolicy) {
        self.policies.insert(name.into(), policy);
    }

    pub fn get_policy<T: 'static>(&self) -> SchemaPolicy {
        self.lookup(std::any::type_name::<T>())
    }

    /// Resolve a policy for a fully qualified type name
    pub fn lookup(&self, qualified_name: &str) -> SchemaPolicy {
        self.policies
            .get(qualified_name)
            .or_else(|| self.policies.get(bare_type_name(qualified_name)))
            .map(|policy| policy.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
