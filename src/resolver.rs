//! Lazy, per-cycle memoized variable resolution
//!
//! Context references start out pending. The resolver fills them on first
//! access according to the binding plan and writes the value back into the
//! shared [`ReferenceValue`], so every alias sees it.

use crate::ast::Value;
use crate::context::EvaluationContext;
use crate::dependency::Binding;
use crate::state::StateProvider;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Values computed by the engine, keyed by subject id and alias
pub type ComputedValues = Arc<RwLock<HashMap<String, Value>>>;

/// How one name gets its value
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionStrategy {
    /// Computed subject value or live state of `entity_id`
    ExternalState { entity_id: String },
    /// Supplied by the caller for this evaluation
    CallerSupplied,
    Literal(Value),
    /// Attribute of an entity in live state
    EntityAttribute { entity_id: String, attribute: String },
    /// Filled in by another phase (nested formulas, `state`)
    Deferred,
}

/// Names needed by one formula and how each resolves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingPlan {
    strategies: BTreeMap<String, ResolutionStrategy>,
}

impl BindingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan for declared bindings; nested formulas are deferred
    pub fn from_bindings(bindings: &BTreeMap<String, Binding>) -> Self {
        let strategies = bindings
            .iter()
            .map(|(name, binding)| {
                let strategy = match binding {
                    Binding::Entity(id) => ResolutionStrategy::ExternalState {
                        entity_id: id.clone(),
                    },
                    Binding::Literal(value) => ResolutionStrategy::Literal(value.clone()),
                    Binding::Formula(_) => ResolutionStrategy::Deferred,
                    Binding::CallerSupplied => ResolutionStrategy::CallerSupplied,
                };
                (name.clone(), strategy)
            })
            .collect();
        Self { strategies }
    }

    pub fn insert(&mut self, name: impl Into<String>, strategy: ResolutionStrategy) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn strategy(&self, name: &str) -> Option<&ResolutionStrategy> {
        self.strategies.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }

    /// Entity id that `name` is looked up under
    pub fn entity_id_for<'a>(&'a self, name: &'a str) -> &'a str {
        match self.strategies.get(name) {
            Some(ResolutionStrategy::ExternalState { entity_id }) => entity_id,
            _ => name,
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Resolves pending references for one subject
pub struct LazyResolver {
    provider: Arc<dyn StateProvider>,
    computed: ComputedValues,
    plan: BindingPlan,
    memo: HashMap<String, Option<Value>>,
    prefetched: HashMap<String, Option<Value>>,
    caller_values: HashMap<String, Value>,
    deferred: HashMap<String, Value>,
    strategy_invocations: usize,
}

impl LazyResolver {
    pub fn new(provider: Arc<dyn StateProvider>, plan: BindingPlan) -> Self {
        Self::with_computed(provider, plan, ComputedValues::default())
    }

    pub fn with_computed(
        provider: Arc<dyn StateProvider>,
        plan: BindingPlan,
        computed: ComputedValues,
    ) -> Self {
        Self {
            provider,
            computed,
            plan,
            memo: HashMap::new(),
            prefetched: HashMap::new(),
            caller_values: HashMap::new(),
            deferred: HashMap::new(),
            strategy_invocations: 0,
        }
    }

    pub fn plan(&self) -> &BindingPlan {
        &self.plan
    }

    pub fn set_plan(&mut self, plan: BindingPlan) {
        self.plan = plan;
    }

    /// Begin a new evaluation cycle: drops memoized, prefetched and deferred
    /// values and resets the invocation counter.
    pub fn start_cycle(&mut self) {
        self.memo.clear();
        self.prefetched.clear();
        self.deferred.clear();
        self.strategy_invocations = 0;
    }

    /// Values for [`ResolutionStrategy::CallerSupplied`] names
    pub fn set_caller_values(&mut self, values: HashMap<String, Value>) {
        self.caller_values = values;
    }

    /// Provide the value of a [`ResolutionStrategy::Deferred`] name
    pub fn supply_deferred(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.memo.remove(&name);
        self.deferred.insert(name, value);
    }

    /// Times a strategy actually ran in this cycle
    pub fn strategy_invocations(&self) -> usize {
        self.strategy_invocations
    }

    /// Bulk-fetch live values for the external names among `names`. Only
    /// saves lookups; resolution gives the same answers without it.
    pub fn prepare_batch(&mut self, names: &[String]) -> usize {
        let computed = self.computed.read().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = names
            .iter()
            .filter(|name| match self.plan.strategy(name) {
                Some(ResolutionStrategy::ExternalState { .. }) | None => true,
                Some(_) => false,
            })
            .map(|name| self.plan.entity_id_for(name).to_string())
            .filter(|id| !computed.contains_key(id) && !self.prefetched.contains_key(id))
            .collect();
        drop(computed);

        if ids.is_empty() {
            return 0;
        }
        let fetched = self.provider.lookup_many(&ids);
        let count = fetched.len();
        self.prefetched.extend(fetched);
        debug!(count, "prefetched external values");
        count
    }

    /// Value of `name` in this cycle, resolving it on first access.
    ///
    /// A failure yields `None` and a warning; it never stops the resolution
    /// of other names.
    pub fn resolve_if_needed(&mut self, context: &EvaluationContext, name: &str) -> Option<Value> {
        if let Some(value) = self.memo.get(name) {
            return value.clone();
        }

        let reference = match context.get_reference(name) {
            Ok(reference) => reference,
            Err(e) => {
                warn!(name, error = %e, "cannot resolve name");
                self.memo.insert(name.to_string(), None);
                return None;
            }
        };

        if let Some(value) = reference.value() {
            self.memo.insert(name.to_string(), Some(value.clone()));
            return Some(value);
        }

        let resolved = self.run_strategy(name);
        reference.set_value(resolved.clone());
        self.memo.insert(name.to_string(), resolved.clone());
        resolved
    }

    /// Resolve several names, returning each outcome
    pub fn resolve_all(
        &mut self,
        context: &EvaluationContext,
        names: &[String],
    ) -> HashMap<String, Option<Value>> {
        names
            .iter()
            .map(|name| (name.clone(), self.resolve_if_needed(context, name)))
            .collect()
    }

    fn run_strategy(&mut self, name: &str) -> Option<Value> {
        self.strategy_invocations += 1;

        let resolved = match self.plan.strategy(name).cloned() {
            Some(ResolutionStrategy::ExternalState { entity_id }) => self.lookup_external(&entity_id),
            Some(ResolutionStrategy::CallerSupplied) => self.caller_values.get(name).cloned(),
            Some(ResolutionStrategy::Literal(value)) => Some(value),
            Some(ResolutionStrategy::EntityAttribute { entity_id, attribute }) => {
                self.provider.lookup_attribute(&entity_id, &attribute)
            }
            Some(ResolutionStrategy::Deferred) => self.deferred.get(name).cloned(),
            None => self.lookup_external(name),
        };

        if resolved.is_none() {
            warn!(name, "name resolved to no value");
        }
        resolved
    }

    fn lookup_external(&self, id: &str) -> Option<Value> {
        let computed = self
            .computed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if computed.is_some() {
            return computed;
        }
        match self.prefetched.get(id) {
            Some(value) => value.clone(),
            None => self.provider.lookup_value(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextRegistry, ReferenceValue};
    use crate::state::InMemoryState;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that counts single and bulk lookups
    #[derive(Default)]
    struct CountingState {
        inner: InMemoryState,
        single: AtomicUsize,
        bulk: AtomicUsize,
    }

    impl StateProvider for CountingState {
        fn lookup_value(&self, name: &str) -> Option<Value> {
            self.single.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup_value(name)
        }

        fn lookup_many(&self, names: &[String]) -> HashMap<String, Option<Value>> {
            self.bulk.fetch_add(1, Ordering::SeqCst);
            names
                .iter()
                .map(|n| (n.clone(), self.inner.lookup_value(n)))
                .collect()
        }

        fn lookup_attribute(&self, entity_id: &str, attribute: &str) -> Option<Value> {
            self.inner.lookup_attribute(entity_id, attribute)
        }

        fn known_names(&self) -> HashSet<String> {
            self.inner.known_names()
        }
    }

    fn plan() -> BindingPlan {
        BindingPlan::from_bindings(&BTreeMap::from([
            ("a".to_string(), Binding::entity("external.x")),
            ("b".to_string(), Binding::entity("external.y")),
            ("k".to_string(), Binding::literal(10)),
            ("who".to_string(), Binding::CallerSupplied),
            ("nested".to_string(), Binding::formula("a + 1")),
        ]))
    }

    fn setup() -> (Arc<CountingState>, crate::context::SharedContext) {
        let state = Arc::new(CountingState::default());
        state.inner.set("external.x", 3);
        state.inner.set("external.y", 4);

        let registry = ContextRegistry::new();
        let context = registry.create("subject").unwrap();
        {
            let mut ctx = context.lock().unwrap();
            for name in ["a", "b", "k", "who", "nested", "ghost"] {
                ctx.set(name, ReferenceValue::pending(name)).unwrap();
            }
        }
        (state, context)
    }

    #[test]
    fn test_memoized_within_cycle() {
        let (state, context) = setup();
        let ctx = context.lock().unwrap();
        let mut resolver = LazyResolver::new(state.clone(), plan());
        resolver.start_cycle();

        assert_eq!(resolver.resolve_if_needed(&ctx, "a"), Some(Value::Int(3)));
        assert_eq!(resolver.resolve_if_needed(&ctx, "a"), Some(Value::Int(3)));
        assert_eq!(resolver.strategy_invocations(), 1);
        assert_eq!(state.single.load(Ordering::SeqCst), 1);

        resolver.start_cycle();
        assert_eq!(resolver.strategy_invocations(), 0);
    }

    #[test]
    fn test_entity_attribute_strategy() {
        let (state, context) = setup();
        state.inner.set_attribute("external.x", "unit", "W");
        let mut ctx = context.lock().unwrap();
        ctx.set("external.x.unit", ReferenceValue::pending("external.x.unit"))
            .unwrap();

        let mut plan = plan();
        plan.insert(
            "external.x.unit",
            ResolutionStrategy::EntityAttribute {
                entity_id: "external.x".into(),
                attribute: "unit".into(),
            },
        );
        let mut resolver = LazyResolver::new(state.clone(), plan);
        resolver.start_cycle();

        assert_eq!(
            resolver.resolve_if_needed(&ctx, "external.x.unit"),
            Some(Value::from("W"))
        );
        // attributes never go through the value lookup
        assert_eq!(state.single.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_value_written_back_into_reference() {
        let (state, context) = setup();
        let ctx = context.lock().unwrap();
        let mut resolver = LazyResolver::new(state, plan());
        resolver.start_cycle();

        resolver.resolve_if_needed(&ctx, "b");
        assert_eq!(ctx.get_reference("b").unwrap().value(), Some(Value::Int(4)));

        // Already carries a value: next cycle does not run the strategy
        resolver.start_cycle();
        assert_eq!(resolver.resolve_if_needed(&ctx, "b"), Some(Value::Int(4)));
        assert_eq!(resolver.strategy_invocations(), 0);
    }

    #[test]
    fn test_strategies() {
        let (state, context) = setup();
        let ctx = context.lock().unwrap();
        let mut resolver = LazyResolver::new(state, plan());
        resolver.start_cycle();
        resolver.set_caller_values(HashMap::from([("who".to_string(), Value::from("me"))]));
        resolver.supply_deferred("nested", Value::Int(4));

        assert_eq!(resolver.resolve_if_needed(&ctx, "k"), Some(Value::Int(10)));
        assert_eq!(resolver.resolve_if_needed(&ctx, "who"), Some(Value::from("me")));
        assert_eq!(resolver.resolve_if_needed(&ctx, "nested"), Some(Value::Int(4)));
    }

    #[test]
    fn test_failure_does_not_stop_siblings() {
        let (state, context) = setup();
        let ctx = context.lock().unwrap();
        let mut resolver = LazyResolver::new(state, plan());
        resolver.start_cycle();

        let names: Vec<String> = ["ghost", "not_in_context", "a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let resolved = resolver.resolve_all(&ctx, &names);

        assert_eq!(resolved["ghost"], None);
        assert_eq!(resolved["not_in_context"], None);
        assert_eq!(resolved["a"], Some(Value::Int(3)));
    }

    #[test]
    fn test_prefetch_avoids_single_lookups() {
        let (state, context) = setup();
        let ctx = context.lock().unwrap();
        let mut resolver = LazyResolver::new(state.clone(), plan());
        resolver.start_cycle();

        let names = vec!["a".to_string(), "b".to_string(), "k".to_string()];
        assert_eq!(resolver.prepare_batch(&names), 2);
        assert_eq!(resolver.resolve_if_needed(&ctx, "a"), Some(Value::Int(3)));
        assert_eq!(resolver.resolve_if_needed(&ctx, "b"), Some(Value::Int(4)));

        assert_eq!(state.bulk.load(Ordering::SeqCst), 1);
        assert_eq!(state.single.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_computed_values_take_precedence() {
        let (state, context) = setup();
        let ctx = context.lock().unwrap();
        let computed = ComputedValues::default();
        computed
            .write()
            .unwrap()
            .insert("external.x".to_string(), Value::Int(99));

        let mut resolver = LazyResolver::with_computed(state, plan(), computed);
        resolver.start_cycle();
        assert_eq!(resolver.resolve_if_needed(&ctx, "a"), Some(Value::Int(99)));
    }
}
