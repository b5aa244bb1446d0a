//! Hierarchical evaluation context
//!
//! A context is a stack of named layers. Lookups search innermost first, so
//! inner layers shadow outer ones. The only mutation path is
//! [`EvaluationContext::set`], which refuses raw scalars under user-visible
//! keys: those must be wrapped in a [`ReferenceValue`].
//!
//! Contexts can only be obtained from a [`ContextRegistry`], which hands out
//! exactly one context per evaluation subject for its whole lifetime.

use crate::ast::Value;
use crate::error::EngineError;
use crate::evaluator::Scope;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Keys starting with this prefix are reserved for the engine
pub const INFRASTRUCTURE_PREFIX: &str = "_";

pub fn is_infrastructure_key(key: &str) -> bool {
    key.starts_with(INFRASTRUCTURE_PREFIX)
}

/// Function value exposed to formulas through the context
pub type Callable = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A named binding whose value may not be resolved yet.
///
/// Clones share storage, so resolving one handle is visible through every
/// alias of the same reference.
#[derive(Debug, Clone)]
pub struct ReferenceValue {
    reference: String,
    value: Arc<RwLock<Option<Value>>>,
}

impl ReferenceValue {
    pub fn new(reference: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            reference: reference.into(),
            value: Arc::new(RwLock::new(value)),
        }
    }

    pub fn resolved(reference: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(reference, Some(value.into()))
    }

    /// Not yet resolved
    pub fn pending(reference: impl Into<String>) -> Self {
        Self::new(reference, None)
    }

    /// Name of what this binding refers to (an entity id or variable name)
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn value(&self) -> Option<Value> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Store a resolved value; all aliases observe it
    pub fn set_value(&self, value: Option<Value>) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn shares_storage_with(&self, other: &ReferenceValue) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl PartialEq for ReferenceValue {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference && self.value() == other.value()
    }
}

/// Values allowed besides references. `Scalar` is only legal under
/// infrastructure keys.
#[derive(Clone)]
pub enum InfraValue {
    Scalar(Value),
    Callable(Callable),
    Mapping(BTreeMap<String, Value>),
    Null,
}

impl fmt::Debug for InfraValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfraValue::Scalar(value) => f.debug_tuple("Scalar").field(value).finish(),
            InfraValue::Callable(_) => f.write_str("Callable(<fn>)"),
            InfraValue::Mapping(map) => f.debug_tuple("Mapping").field(map).finish(),
            InfraValue::Null => f.write_str("Null"),
        }
    }
}

/// Anything a context layer can hold
#[derive(Debug, Clone)]
pub enum ContextValue {
    Reference(ReferenceValue),
    Infra(InfraValue),
}

impl ContextValue {
    pub fn as_reference(&self) -> Option<&ReferenceValue> {
        match self {
            ContextValue::Reference(reference) => Some(reference),
            ContextValue::Infra(_) => None,
        }
    }

    pub fn callable(f: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        ContextValue::Infra(InfraValue::Callable(Arc::new(f)))
    }

    fn type_name(&self) -> &'static str {
        match self {
            ContextValue::Reference(_) => "reference",
            ContextValue::Infra(InfraValue::Scalar(value)) => value.type_name(),
            ContextValue::Infra(InfraValue::Callable(_)) => "callable",
            ContextValue::Infra(InfraValue::Mapping(_)) => "mapping",
            ContextValue::Infra(InfraValue::Null) => "null",
        }
    }
}

impl From<ReferenceValue> for ContextValue {
    fn from(value: ReferenceValue) -> Self {
        ContextValue::Reference(value)
    }
}

impl From<InfraValue> for ContextValue {
    fn from(value: InfraValue) -> Self {
        ContextValue::Infra(value)
    }
}

impl From<Value> for ContextValue {
    fn from(value: Value) -> Self {
        ContextValue::Infra(InfraValue::Scalar(value))
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Value::Int(value).into()
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        Value::from(value).into()
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        Value::Float(value).into()
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Value::Bool(value).into()
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Value::from(value).into()
    }
}

/// One named scope
#[derive(Debug, Clone, Default)]
pub struct ContextLayer {
    pub name: String,
    entries: BTreeMap<String, ContextValue>,
}

impl ContextLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Point-in-time view of a context's integrity counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegritySnapshot {
    pub instance_id: Uuid,
    pub item_count: u64,
    pub generation: u64,
}

impl IntegritySnapshot {
    /// A later snapshot must come from the same instance with counters that
    /// never went backwards.
    pub fn verify_successor(&self, later: &IntegritySnapshot) -> Result<(), EngineError> {
        if later.instance_id != self.instance_id {
            return Err(EngineError::ContextIntegrity {
                message: format!(
                    "context instance changed from {} to {}",
                    self.instance_id, later.instance_id
                ),
            });
        }
        if later.item_count < self.item_count || later.generation < self.generation {
            return Err(EngineError::ContextIntegrity {
                message: format!(
                    "counters regressed: items {} -> {}, generation {} -> {}",
                    self.item_count, later.item_count, self.generation, later.generation
                ),
            });
        }
        Ok(())
    }
}

/// Layered variable scope owned by one evaluation subject
#[derive(Debug)]
pub struct EvaluationContext {
    instance_id: Uuid,
    subject: String,
    layers: Vec<ContextLayer>,
    generation: u64,
    item_count: u64,
}

impl EvaluationContext {
    fn new(subject: &str) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            subject: subject.to_string(),
            layers: vec![ContextLayer::new("base")],
            generation: 0,
            item_count: 0,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Number of layers, including the base layer
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    /// Push an empty layer
    pub fn push_layer(&mut self, name: impl Into<String>) {
        let name = name.into();
        debug!(subject = %self.subject, layer = %name, "push layer");
        self.layers.push(ContextLayer::new(name));
        self.generation += 1;
    }

    /// Push a layer pre-populated with `entries`, each checked as by [`set`](Self::set).
    /// On a violation nothing is pushed.
    #[track_caller]
    pub fn push_layer_with<I, K, V>(&mut self, name: impl Into<String>, entries: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ContextValue>,
    {
        let caller = Location::caller();
        let mut layer = ContextLayer::new(name);
        for (key, value) in entries {
            let key = key.into();
            let value = value.into();
            check_write(&key, &value, caller)?;
            layer.entries.insert(key, value);
        }

        debug!(subject = %self.subject, layer = %layer.name, entries = layer.len(), "push layer");
        self.item_count += layer.len() as u64;
        self.layers.push(layer);
        self.generation += 1;
        Ok(())
    }

    /// Remove and return the innermost layer. The base layer is never popped.
    pub fn pop_layer(&mut self) -> Option<ContextLayer> {
        if self.layers.len() <= 1 {
            return None;
        }
        let layer = self.layers.pop()?;
        debug!(subject = %self.subject, layer = %layer.name, "pop layer");
        self.generation += 1;
        Some(layer)
    }

    /// Write `value` under `key` in the innermost layer.
    ///
    /// A raw scalar under a user-visible key is rejected with a
    /// [`EngineError::ContextIntegrity`] naming the key, the received type and
    /// the caller's location.
    #[track_caller]
    pub fn set(&mut self, key: &str, value: impl Into<ContextValue>) -> Result<(), EngineError> {
        let value = value.into();
        check_write(key, &value, Location::caller())?;

        let layer = match self.layers.last_mut() {
            Some(layer) => layer,
            None => {
                return Err(EngineError::ContextIntegrity {
                    message: format!("context for '{}' has no layers", self.subject),
                })
            }
        };
        if layer.entries.insert(key.to_string(), value).is_none() {
            self.item_count += 1;
        }
        Ok(())
    }

    /// Innermost binding for `key`. A missing key is an error, not a null.
    pub fn get(&self, key: &str) -> Result<&ContextValue, EngineError> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.get(key))
            .ok_or_else(|| EngineError::UndefinedVariable {
                name: key.to_string(),
            })
    }

    /// Innermost binding for `key`, which must be a reference
    pub fn get_reference(&self, key: &str) -> Result<ReferenceValue, EngineError> {
        match self.get(key)? {
            ContextValue::Reference(reference) => Ok(reference.clone()),
            other => Err(EngineError::ContextIntegrity {
                message: format!("key '{}' holds a {} value, not a reference", key, other.type_name()),
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.layers.iter().any(|layer| layer.contains(key))
    }

    /// Fold layers outer to inner into one mapping; inner values win
    pub fn flatten(&self) -> BTreeMap<String, ContextValue> {
        let mut flat = BTreeMap::new();
        for layer in &self.layers {
            for (key, value) in &layer.entries {
                flat.insert(key.clone(), value.clone());
            }
        }
        flat
    }

    /// Materialize the flattened context into what the evaluator consumes.
    ///
    /// Infrastructure keys are skipped. Unresolved references are left out so
    /// the evaluator reports them as undefined. Mappings are exposed as
    /// `key.field` entries.
    pub fn materialize(&self) -> Scope {
        let mut scope = Scope::new();
        for (key, value) in self.flatten() {
            if is_infrastructure_key(&key) {
                continue;
            }
            match value {
                ContextValue::Reference(reference) => {
                    if let Some(value) = reference.value() {
                        scope.insert(key, value);
                    }
                }
                ContextValue::Infra(InfraValue::Callable(f)) => scope.insert_callable(key, f),
                ContextValue::Infra(InfraValue::Mapping(map)) => {
                    for (field, value) in map {
                        scope.insert(format!("{}.{}", key, field), value);
                    }
                }
                ContextValue::Infra(InfraValue::Null) => scope.insert(key, Value::Null),
                // rejected by `set` for user-visible keys
                ContextValue::Infra(InfraValue::Scalar(_)) => {}
            }
        }
        scope
    }

    pub fn snapshot(&self) -> IntegritySnapshot {
        IntegritySnapshot {
            instance_id: self.instance_id,
            item_count: self.item_count,
            generation: self.generation,
        }
    }
}

fn check_write(key: &str, value: &ContextValue, caller: &Location<'_>) -> Result<(), EngineError> {
    if is_infrastructure_key(key) {
        return Ok(());
    }
    if let ContextValue::Infra(InfraValue::Scalar(raw)) = value {
        return Err(EngineError::raw_value_write(key, raw.type_name(), caller));
    }
    Ok(())
}

/// Shared handle to a subject's context
pub type SharedContext = Arc<Mutex<EvaluationContext>>;

/// The only way to obtain an [`EvaluationContext`]
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<String, SharedContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the context for `subject`; fails if one already exists
    pub fn create(&self, subject: &str) -> Result<SharedContext, EngineError> {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if contexts.contains_key(subject) {
            return Err(EngineError::DuplicateContext {
                subject: subject.to_string(),
            });
        }
        let context = Arc::new(Mutex::new(EvaluationContext::new(subject)));
        contexts.insert(subject.to_string(), Arc::clone(&context));
        debug!(subject, "created evaluation context");
        Ok(context)
    }

    pub fn get(&self, subject: &str) -> Option<SharedContext> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .cloned()
    }

    /// Forget a subject's context, e.g. when the subject is removed
    pub fn remove(&self, subject: &str) -> bool {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
