//! External state access
//!
//! The engine never owns live values. It reads them through a
//! [`StateProvider`], which is the only collaborator it consumes at runtime.

use crate::ast::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Live value store of externally managed named entities
pub trait StateProvider: Send + Sync {
    /// Current value of `name`, or `None` when unavailable
    fn lookup_value(&self, name: &str) -> Option<Value>;

    /// Bulk lookup. Implementations backed by a remote store should override
    /// this to avoid one round trip per name.
    fn lookup_many(&self, names: &[String]) -> HashMap<String, Option<Value>> {
        names
            .iter()
            .map(|name| (name.clone(), self.lookup_value(name)))
            .collect()
    }

    /// Attribute of an entity (`sensor.battery` / `level`). Providers without
    /// attributes keep the default.
    fn lookup_attribute(&self, _entity_id: &str, _attribute: &str) -> Option<Value> {
        None
    }

    /// Names the provider knows about, whether or not they have a value now
    fn known_names(&self) -> HashSet<String>;

    /// Whether `name` is registered with the provider
    fn is_known(&self, name: &str) -> bool {
        self.known_names().contains(name)
    }
}

/// In-process state store
///
/// A registered entity may hold `None`, which models a known but
/// currently unavailable entity.
#[derive(Debug, Default)]
pub struct InMemoryState {
    values: RwLock<HashMap<String, Option<Value>>>,
    attributes: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryState {
    /// Create a new empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an entity value
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Some(value.into()));
    }

    /// Mark an entity as known but unavailable
    pub fn set_unavailable(&self, name: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), None);
    }

    /// Add or update an attribute of an entity
    pub fn set_attribute(
        &self,
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<Value>,
    ) {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity_id.into())
            .or_default()
            .insert(attribute.into(), value.into());
    }

    /// Remove an entity entirely, attributes included
    pub fn remove(&self, name: &str) -> Option<Option<Value>> {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl StateProvider for InMemoryState {
    fn lookup_value(&self, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .flatten()
    }

    fn lookup_attribute(&self, entity_id: &str, attribute: &str) -> Option<Value> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .and_then(|attrs| attrs.get(attribute))
            .cloned()
    }

    fn known_names(&self) -> HashSet<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn is_known(&self, name: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}
