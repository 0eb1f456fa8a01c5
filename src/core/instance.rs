//! CP-005: Live instances and the identity-keyed arena that holds them.
//!
//! Identities are hierarchical: a top-level instance is its declared name,
//! a child is `parent-id.local-name`. The arena is a flat map from identity to
//! instance, so parent/child links survive serialization as plain strings.

use super::error::{EngineError, Result};
use crate::driver::Driver;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Full identity of `local` inside the scope owned by `parent`.
pub fn child_id(parent: Option<&str>, local: &str) -> String {
    match parent {
        Some(p) => format!("{}.{}", p, local),
        None => local.to_string(),
    }
}

/// Identity of the parent that constructed `id`, if any.
pub fn parent_of(id: &str) -> Option<&str> {
    id.rsplit_once('.').map(|(parent, _)| parent)
}

/// A settled (or rehydrated) instance.
#[derive(Clone)]
pub struct Instance {
    pub id: String,
    pub type_name: String,
    /// Resolved inputs
    pub inputs: Value,
    pub outputs: Value,
    /// Full identities of children, in construction order
    pub children: Vec<String>,
    /// Full identities of providers this instance read from
    pub dependencies: Vec<String>,
    pub fingerprint: String,
    pub driver: Arc<dyn Driver>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("children", &self.children)
            .field("dependencies", &self.dependencies)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Arena of instances keyed by identity. Each identity is written once.
#[derive(Debug, Clone, Default)]
pub struct InstanceGraph {
    instances: IndexMap<String, Instance>,
}

impl InstanceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance; a second write of the same identity is rejected.
    pub fn insert(&mut self, instance: Instance) -> Result<()> {
        if self.instances.contains_key(&instance.id) {
            return Err(EngineError::Validation(format!(
                "instance '{}' recorded twice in one run",
                instance.id
            )));
        }
        self.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Drop `id` from the arena, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<Instance> {
        self.instances.shift_remove(id)
    }

    /// `id` and everything it constructed, children before parents and later
    /// siblings before earlier ones. This is the teardown order.
    pub fn teardown_order(&self, id: &str) -> Vec<String> {
        let mut order = Vec::new();
        self.collect_teardown(id, &mut order);
        order
    }

    fn collect_teardown(&self, id: &str, order: &mut Vec<String>) {
        if let Some(instance) = self.instances.get(id) {
            for child in instance.children.iter().rev() {
                self.collect_teardown(child, order);
            }
        }
        order.push(id.to_string());
    }
}
