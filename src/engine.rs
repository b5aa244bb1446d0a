//! Formula engine
//!
//! Owns the registered subjects and their per-subject runtime (context and
//! lazy resolver), and drives one evaluation cycle per subject:
//!
//! 1. local self-reference check
//! 2. push a `cycle` layer of pending references and resolve them
//! 3. validate dependencies (missing / unavailable)
//! 4. evaluate nested formula bindings, then the main formula
//! 5. evaluate attribute formulas, each in its own transient layer, with
//!    `state` bound to the main result
//! 6. pop the layer and verify the context's integrity counters
//!
//! Caches are injected, never global, so several engines can share or
//! isolate them as needed.

use crate::analyzer::{FormulaAnalysis, FormulaAnalyzer, SELF_TOKEN, STATE_TOKEN};
use crate::ast::Value;
use crate::circular::CircularReferenceDetector;
use crate::config::EngineConfig;
use crate::context::{ContextRegistry, ContextValue, EvaluationContext, ReferenceValue, SharedContext};
use crate::dependency::{Binding, DependencyExtractor, DependencyQuery, DependencyValidator};
use crate::error::EngineError;
use crate::evaluator::{Evaluator, ExpressionEvaluator, Scope};
use crate::graph::{
    CrossEntityDependencyManager, CrossEntityValidation, DependencyGraph, EvaluationOrder,
    SubjectDependencies,
};
use crate::resolver::{BindingPlan, ComputedValues, LazyResolver, ResolutionStrategy};
use crate::result_cache::{context_fingerprint, variant_fingerprint, ResultCache};
use crate::state::StateProvider;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Values substituted when a subject cannot produce a normal result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlternateStates {
    /// Used when a dependency is known but has no value
    #[serde(default)]
    pub unavailable: Option<Value>,
    /// Used when the formula evaluates to `None`
    #[serde(default)]
    pub none: Option<Value>,
}

/// Secondary formula evaluated after the main one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeFormula {
    pub formula: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Binding>,
}

impl AttributeFormula {
    pub fn new(formula: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.variables.insert(name.into(), binding);
        self
    }
}

/// A derived value: formula text plus declared variable bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    /// Entity id other formulas may use to refer to this subject
    #[serde(default)]
    pub entity_id: Option<String>,
    pub formula: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Binding>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeFormula>,
    #[serde(default)]
    pub alternate_states: AlternateStates,
}

impl Subject {
    pub fn new(id: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_id: None,
            formula: formula.into(),
            variables: BTreeMap::new(),
            attributes: BTreeMap::new(),
            alternate_states: AlternateStates::default(),
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.variables.insert(name.into(), binding);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attribute: AttributeFormula) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    pub fn with_alternate_states(mut self, alternate_states: AlternateStates) -> Self {
        self.alternate_states = alternate_states;
        self
    }

    /// Formula texts owned by this subject: main, attributes and nested bindings
    pub fn formulas(&self) -> Vec<&str> {
        let mut formulas = vec![self.formula.as_str()];
        let bindings = self
            .variables
            .values()
            .chain(self.attributes.values().flat_map(|a| a.variables.values()));
        for binding in bindings {
            if let Binding::Formula(text) = binding {
                formulas.push(text);
            }
        }
        formulas.extend(self.attributes.values().map(|a| a.formula.as_str()));
        formulas
    }

    fn aliases(&self) -> Vec<&str> {
        self.entity_id.iter().map(String::as_str).collect()
    }
}

/// Outcome of evaluating one subject
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectEvaluation {
    pub value: Value,
    /// Each attribute fails or succeeds on its own
    pub attributes: BTreeMap<String, Result<Value, EngineError>>,
    /// Main result was served from the result cache
    pub from_cache: bool,
}

/// Report of one dependency-ordered pass over every subject
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluationPass {
    pub order: Vec<String>,
    pub cyclic: Vec<String>,
    pub results: BTreeMap<String, Result<SubjectEvaluation, EngineError>>,
}

impl EvaluationPass {
    pub fn value(&self, subject: &str) -> Option<&Value> {
        match self.results.get(subject) {
            Some(Ok(evaluation)) => Some(&evaluation.value),
            _ => None,
        }
    }

    pub fn error(&self, subject: &str) -> Option<&EngineError> {
        match self.results.get(subject) {
            Some(Err(error)) => Some(error),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.values().filter(|r| r.is_err()).count()
    }
}

#[derive(Default)]
struct SubjectTable {
    order: Vec<String>,
    by_id: HashMap<String, Arc<Subject>>,
}

type SharedResolver = Arc<Mutex<LazyResolver>>;

/// Dependency-aware formula engine
pub struct FormulaEngine {
    config: EngineConfig,
    provider: Arc<dyn StateProvider>,
    analyzer: Arc<FormulaAnalyzer>,
    result_cache: Arc<ResultCache>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    validator: DependencyValidator,
    contexts: ContextRegistry,
    resolvers: Mutex<HashMap<String, SharedResolver>>,
    subjects: RwLock<SubjectTable>,
    computed: ComputedValues,
}

impl FormulaEngine {
    /// Engine with its own caches sized from `config`
    pub fn new(config: EngineConfig, provider: Arc<dyn StateProvider>) -> Self {
        let analyzer = Arc::new(FormulaAnalyzer::new(&config));
        let result_cache = Arc::new(ResultCache::new(&config.cache));
        Self::with_shared_caches(config, provider, analyzer, result_cache)
    }

    /// Engine using caches shared with other engines
    pub fn with_shared_caches(
        config: EngineConfig,
        provider: Arc<dyn StateProvider>,
        analyzer: Arc<FormulaAnalyzer>,
        result_cache: Arc<ResultCache>,
    ) -> Self {
        let validator = DependencyValidator::new(config.entity_domains.clone());
        Self {
            config,
            provider,
            analyzer,
            result_cache,
            evaluator: Arc::new(Evaluator::new()),
            validator,
            contexts: ContextRegistry::new(),
            resolvers: Mutex::new(HashMap::new()),
            subjects: RwLock::new(SubjectTable::default()),
            computed: ComputedValues::default(),
        }
    }

    /// Replace the expression evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &FormulaAnalyzer {
        &self.analyzer
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.result_cache
    }

    // =========================================================================
    // Subjects
    // =========================================================================

    /// Register a subject and create its evaluation context
    pub fn register_subject(&self, subject: Subject) -> Result<(), EngineError> {
        let mut table = self.subjects.write().unwrap_or_else(PoisonError::into_inner);
        if table.by_id.contains_key(&subject.id) {
            return Err(EngineError::DuplicateSubject {
                subject: subject.id.clone(),
            });
        }

        self.contexts.create(&subject.id)?;
        let resolver = LazyResolver::with_computed(
            Arc::clone(&self.provider),
            BindingPlan::new(),
            Arc::clone(&self.computed),
        );
        self.resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.id.clone(), Arc::new(Mutex::new(resolver)));

        debug!(subject = %subject.id, formula = %subject.formula, "registered subject");
        table.order.push(subject.id.clone());
        table.by_id.insert(subject.id.clone(), Arc::new(subject));
        Ok(())
    }

    /// Remove a subject along with its context and computed value
    pub fn remove_subject(&self, id: &str) -> bool {
        let mut table = self.subjects.write().unwrap_or_else(PoisonError::into_inner);
        let Some(subject) = table.by_id.remove(id) else {
            return false;
        };
        table.order.retain(|s| s != id);

        // under the table lock, so a re-registration sees a clean slate
        self.contexts.remove(id);
        self.resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.forget_computed(&subject);
        drop(table);
        true
    }

    pub fn subject(&self, id: &str) -> Option<Arc<Subject>> {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(id)
            .cloned()
    }

    /// Registered subject ids in registration order
    pub fn subject_ids(&self) -> Vec<String> {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    fn subjects_in_order(&self) -> Vec<Arc<Subject>> {
        let table = self.subjects.read().unwrap_or_else(PoisonError::into_inner);
        table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id).cloned())
            .collect()
    }

    /// Ids and aliases of every subject
    fn subject_registry(&self) -> HashSet<String> {
        let table = self.subjects.read().unwrap_or_else(PoisonError::into_inner);
        table
            .by_id
            .values()
            .flat_map(|s| std::iter::once(s.id.clone()).chain(s.entity_id.clone()))
            .collect()
    }

    /// Context of a subject, for inspection
    pub fn context(&self, id: &str) -> Option<SharedContext> {
        self.contexts.get(id)
    }

    /// Most recent value computed for a subject (by id or alias)
    pub fn computed_value(&self, id: &str) -> Option<Value> {
        self.computed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn store_computed(&self, subject: &Subject, value: &Value) {
        let mut computed = self.computed.write().unwrap_or_else(PoisonError::into_inner);
        computed.insert(subject.id.clone(), value.clone());
        if let Some(alias) = &subject.entity_id {
            computed.insert(alias.clone(), value.clone());
        }
    }

    fn forget_computed(&self, subject: &Subject) {
        let mut computed = self.computed.write().unwrap_or_else(PoisonError::into_inner);
        computed.remove(&subject.id);
        if let Some(alias) = &subject.entity_id {
            computed.remove(alias);
        }
    }

    // =========================================================================
    // Analysis and ordering
    // =========================================================================

    pub fn analyze(&self, formula: &str) -> Arc<FormulaAnalysis> {
        self.analyzer.analyze(formula)
    }

    /// External dependencies of a main formula, memoized per binding set
    fn dependencies_of(&self, formula: &str, bindings: &BTreeMap<String, Binding>) -> BTreeSet<String> {
        let variant = variant_fingerprint(bindings);
        if let Some(cached) = self.result_cache.get_dependencies(formula, &variant) {
            return cached;
        }
        let dependencies =
            DependencyExtractor::new(&self.analyzer).external_dependencies(formula, bindings);
        self.result_cache
            .put_dependencies(formula, &variant, dependencies.clone());
        dependencies
    }

    /// Dependencies of a subject's main formula. Attribute formulas are excluded.
    pub fn subject_dependencies(&self, subject: &Subject) -> BTreeSet<String> {
        self.dependencies_of(&subject.formula, &subject.variables)
    }

    fn dependency_manager(&self) -> CrossEntityDependencyManager {
        let mut manager = CrossEntityDependencyManager::new(self.config.entity_domains.clone());
        for subject in self.subjects_in_order() {
            manager.register(SubjectDependencies {
                id: subject.id.clone(),
                alias: subject.entity_id.clone(),
                dependencies: self.subject_dependencies(&subject),
            });
        }
        manager
    }

    /// Graph over all registered subjects
    pub fn build_dependency_graph(&self) -> DependencyGraph {
        self.dependency_manager().build_dependency_graph()
    }

    pub fn evaluation_order(&self) -> EvaluationOrder {
        self.build_dependency_graph().evaluation_order()
    }

    /// Cycles and unregistered references across all subjects
    pub fn validate_dependencies(&self) -> CrossEntityValidation {
        self.dependency_manager()
            .validate(&self.provider.known_names())
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate one subject
    pub fn evaluate(&self, id: &str) -> Result<SubjectEvaluation, EngineError> {
        self.evaluate_with(id, HashMap::new())
    }

    /// Evaluate one subject with values for its caller-supplied bindings
    pub fn evaluate_with(
        &self,
        id: &str,
        caller_values: HashMap<String, Value>,
    ) -> Result<SubjectEvaluation, EngineError> {
        let subject = self.subject(id).ok_or_else(|| EngineError::UnknownSubject {
            subject: id.to_string(),
        })?;

        let outcome = self.evaluate_subject(&subject, caller_values);

        // Held while recording so a concurrent removal cannot interleave
        let table = self.subjects.read().unwrap_or_else(PoisonError::into_inner);
        let still_registered = table
            .by_id
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &subject));
        if !still_registered {
            debug!(subject = %subject.id, "subject removed during evaluation; result not recorded");
            return outcome;
        }
        match &outcome {
            Ok(evaluation) => self.store_computed(&subject, &evaluation.value),
            Err(e) => {
                warn!(subject = %subject.id, error = %e, "subject evaluation failed");
                self.forget_computed(&subject);
            }
        }
        drop(table);
        outcome
    }

    /// Evaluate every subject in dependency order. Subjects on or behind a
    /// cycle are not evaluated and report the cycle path.
    pub fn evaluate_all(&self) -> EvaluationPass {
        let graph = self.build_dependency_graph();
        let EvaluationOrder { order, cyclic } = graph.evaluation_order();
        let mut results = BTreeMap::new();

        for id in &cyclic {
            let path = CircularReferenceDetector::find_cycle(&graph, Some(id))
                .unwrap_or_else(|| vec![id.clone(), id.clone()]);
            if let Some(subject) = self.subject(id) {
                self.forget_computed(&subject);
            }
            results.insert(id.clone(), Err(EngineError::CircularDependency { path }));
        }

        for id in &order {
            results.insert(id.clone(), self.evaluate(id));
        }

        let pass = EvaluationPass {
            order,
            cyclic,
            results,
        };
        info!(
            evaluated = pass.order.len(),
            succeeded = pass.succeeded(),
            failed = pass.failed(),
            cyclic = pass.cyclic.len(),
            "evaluation pass complete"
        );
        pass
    }

    /// Context and resolver created at registration. Absent once the subject
    /// has been removed; they are never recreated here.
    fn runtime(&self, subject: &Subject) -> Result<(SharedContext, SharedResolver), EngineError> {
        let unknown = || EngineError::UnknownSubject {
            subject: subject.id.clone(),
        };
        let context = self.contexts.get(&subject.id).ok_or_else(unknown)?;
        let resolver = self
            .resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&subject.id)
            .cloned()
            .ok_or_else(unknown)?;
        Ok((context, resolver))
    }

    #[tracing::instrument(skip(self, subject, caller_values), fields(subject = %subject.id))]
    fn evaluate_subject(
        &self,
        subject: &Subject,
        caller_values: HashMap<String, Value>,
    ) -> Result<SubjectEvaluation, EngineError> {
        let dependencies = self.subject_dependencies(subject);
        CircularReferenceDetector::check_self_reference(&subject.id, &subject.aliases(), &dependencies)?;

        let (context, resolver) = self.runtime(subject)?;
        let mut ctx = context.lock().unwrap_or_else(PoisonError::into_inner);
        let mut resolver = resolver.lock().unwrap_or_else(PoisonError::into_inner);

        // layers left behind by a cycle that panicked mid-way
        while let Some(stale) = ctx.pop_layer() {
            warn!(subject = %subject.id, layer = %stale.name, "discarded stale context layer");
        }

        let before = ctx.snapshot();
        let analysis = self.analyzer.analyze(&subject.formula);

        let mut plan = BindingPlan::from_bindings(&subject.variables);
        resolver.start_cycle();
        resolver.set_caller_values(caller_values);

        let mut entries = cycle_entries(&subject.variables, &dependencies);
        attribute_entries(&analysis, &mut plan, &mut entries);
        if analysis.has_state_token || analysis.has_self_token {
            let previous = self.previous_state(subject);
            for token in [STATE_TOKEN, SELF_TOKEN] {
                plan.insert(token, ResolutionStrategy::Deferred);
                entries.push((token.to_string(), ReferenceValue::pending(token).into()));
                if let Some(previous) = &previous {
                    resolver.supply_deferred(token, previous.clone());
                }
            }
        }
        resolver.set_plan(plan);

        ctx.push_layer_with("cycle", entries)?;
        let outcome = self.run_cycle(subject, &dependencies, &mut ctx, &mut resolver);
        ctx.pop_layer();

        before.verify_successor(&ctx.snapshot())?;
        outcome
    }

    /// Previous computed value, or the live state of the subject's own entity
    fn previous_state(&self, subject: &Subject) -> Option<Value> {
        self.computed_value(&subject.id).or_else(|| {
            subject
                .entity_id
                .as_deref()
                .and_then(|entity_id| self.provider.lookup_value(entity_id))
        })
    }

    fn run_cycle(
        &self,
        subject: &Subject,
        dependencies: &BTreeSet<String>,
        ctx: &mut EvaluationContext,
        resolver: &mut LazyResolver,
    ) -> Result<SubjectEvaluation, EngineError> {
        let unavailable = match self.resolve_layer(&subject.id, &subject.variables, dependencies, ctx, resolver)? {
            Availability::Ready => None,
            Availability::Unavailable(error) => match &subject.alternate_states.unavailable {
                Some(substitute) => Some(substitute.clone()),
                None => return Err(error),
            },
        };

        let (value, from_cache) = match unavailable {
            Some(substitute) => (substitute, false),
            None => {
                self.evaluate_nested(&subject.id, &subject.variables, ctx, resolver)?;
                let (value, from_cache) =
                    self.evaluate_formula(&subject.id, &subject.formula, &ctx.materialize())?;
                match (&value, &subject.alternate_states.none) {
                    (Value::Null, Some(substitute)) => (substitute.clone(), false),
                    _ => (value, from_cache),
                }
            }
        };

        let attributes = subject
            .attributes
            .iter()
            .map(|(name, attribute)| {
                let result = self.evaluate_attribute(subject, name, attribute, &value, ctx);
                if let Err(e) = &result {
                    warn!(subject = %subject.id, attribute = %name, error = %e, "attribute evaluation failed");
                }
                (name.clone(), result)
            })
            .collect();

        Ok(SubjectEvaluation {
            value,
            attributes,
            from_cache,
        })
    }

    /// Resolve every plain reference of the innermost layer and validate
    /// `dependencies` against the outcome. Missing dependencies are an error;
    /// unavailable ones are reported so the caller can substitute.
    fn resolve_layer(
        &self,
        owner: &str,
        bindings: &BTreeMap<String, Binding>,
        dependencies: &BTreeSet<String>,
        ctx: &EvaluationContext,
        resolver: &mut LazyResolver,
    ) -> Result<Availability, EngineError> {
        let names: Vec<String> = ctx
            .flatten()
            .into_iter()
            .filter(|(name, value)| {
                value.as_reference().is_some()
                    && !matches!(bindings.get(name), Some(Binding::Formula(_)))
            })
            .map(|(name, _)| name)
            .collect();

        resolver.prepare_batch(&names);
        let resolved = resolver.resolve_all(ctx, &names);

        let known_entities = self.provider.known_names();
        let subject_registry = self.subject_registry();
        let query = DependencyQuery {
            formula_name: owner,
            dependencies,
            known_entities: &known_entities,
            subject_registry: &subject_registry,
        };
        let validation = self.validator.validate(&query, &resolved);

        if !validation.missing.is_empty() {
            return Err(EngineError::MissingDependency {
                subject: owner.to_string(),
                names: validation.missing.into_iter().collect(),
            });
        }
        if !validation.unavailable.is_empty() {
            return Ok(Availability::Unavailable(EngineError::UnavailableDependency {
                subject: owner.to_string(),
                names: validation.unavailable.into_iter().collect(),
            }));
        }
        Ok(Availability::Ready)
    }

    /// Evaluate nested formula bindings, dependencies first, and hand each
    /// result to the resolver as a deferred value.
    fn evaluate_nested(
        &self,
        owner: &str,
        bindings: &BTreeMap<String, Binding>,
        ctx: &EvaluationContext,
        resolver: &mut LazyResolver,
    ) -> Result<(), EngineError> {
        let nested: BTreeMap<&String, &String> = bindings
            .iter()
            .filter_map(|(name, binding)| match binding {
                Binding::Formula(text) => Some((name, text)),
                _ => None,
            })
            .collect();
        if nested.is_empty() {
            return Ok(());
        }

        let graph = DependencyGraph::from_entries(nested.iter().map(|(&name, &text)| {
            let deps: Vec<String> = self
                .analyzer
                .analyze(text)
                .dependencies
                .iter()
                .filter(|dep| nested.contains_key(dep))
                .cloned()
                .collect();
            (name.clone(), deps)
        }));
        let order = graph.evaluation_order();
        if !order.is_acyclic() {
            let path = CircularReferenceDetector::find_cycle(&graph, None).unwrap_or(order.cyclic);
            return Err(EngineError::CircularDependency { path });
        }

        for name in order.order {
            let Some(&text) = nested.get(&name) else {
                continue;
            };
            let (value, _) = self.evaluate_formula(owner, text, &ctx.materialize())?;
            resolver.supply_deferred(name.clone(), value);
            resolver.resolve_if_needed(ctx, &name);
        }
        Ok(())
    }

    /// Evaluate formula text against a scope, through the result cache
    fn evaluate_formula(&self, owner: &str, formula: &str, scope: &Scope) -> Result<(Value, bool), EngineError> {
        let parsed = self.analyzer.parse(formula);
        let expr = match parsed.as_ref() {
            Ok(expr) => expr,
            Err(e) => return Err(e.clone()),
        };

        let fingerprint = context_fingerprint(scope.values());
        if let Some(value) = self.result_cache.get(formula, &fingerprint) {
            debug!(owner, formula, "result cache hit");
            return Ok((value, true));
        }

        let value = self
            .evaluator
            .evaluate(expr, scope)
            .map_err(|e| EngineError::Evaluation {
                subject: owner.to_string(),
                message: e.to_string(),
            })?;
        self.result_cache.put(formula, &fingerprint, value.clone());
        Ok((value, false))
    }

    /// Attribute phase: a transient layer where `state` is the main result.
    /// Main-formula variables stay visible underneath.
    fn evaluate_attribute(
        &self,
        subject: &Subject,
        name: &str,
        attribute: &AttributeFormula,
        main_value: &Value,
        ctx: &mut EvaluationContext,
    ) -> Result<Value, EngineError> {
        let owner = format!("{}.{}", subject.id, name);
        let dependencies = self.dependencies_of(&attribute.formula, &attribute.variables);

        let mut entries = cycle_entries(&attribute.variables, &dependencies);
        entries.retain(|(key, _)| key != STATE_TOKEN);
        entries.push((
            STATE_TOKEN.to_string(),
            ReferenceValue::resolved(STATE_TOKEN, main_value.clone()).into(),
        ));

        let mut plan = BindingPlan::from_bindings(&attribute.variables);
        let analysis = self.analyzer.analyze(&attribute.formula);
        attribute_entries(&analysis, &mut plan, &mut entries);

        let mut resolver = LazyResolver::with_computed(
            Arc::clone(&self.provider),
            plan,
            Arc::clone(&self.computed),
        );
        resolver.start_cycle();

        ctx.push_layer_with(format!("attribute:{}", name), entries)?;
        let outcome = self
            .resolve_layer(&owner, &attribute.variables, &dependencies, ctx, &mut resolver)
            .and_then(|availability| match availability {
                Availability::Ready => Ok(()),
                Availability::Unavailable(error) => Err(error),
            })
            .and_then(|_| self.evaluate_nested(&owner, &attribute.variables, ctx, &mut resolver))
            .and_then(|_| self.evaluate_formula(&owner, &attribute.formula, &ctx.materialize()))
            .map(|(value, _)| value);
        ctx.pop_layer();
        outcome
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop cached results and dependency sets for a subject's formulas, or
    /// for a raw formula text. Returns the number of dropped results.
    pub fn invalidate(&self, formula_or_subject: &str) -> usize {
        match self.subject(formula_or_subject) {
            Some(subject) => subject
                .formulas()
                .into_iter()
                .map(|formula| self.result_cache.invalidate(formula))
                .sum(),
            None => self.result_cache.invalidate(formula_or_subject),
        }
    }

    /// Drop every cached parse, analysis and result
    pub fn clear_caches(&self) {
        self.analyzer.clear_cache();
        self.result_cache.clear();
    }
}

enum Availability {
    Ready,
    Unavailable(EngineError),
}

/// Pending references for `domain.object.attribute` paths, read from the
/// entity's attributes rather than its state.
fn attribute_entries(
    analysis: &FormulaAnalysis,
    plan: &mut BindingPlan,
    entries: &mut Vec<(String, ContextValue)>,
) {
    for path in &analysis.attribute_references {
        let mut parts = path.splitn(3, '.');
        let (Some(domain), Some(object), Some(attribute)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        plan.insert(
            path.clone(),
            ResolutionStrategy::EntityAttribute {
                entity_id: format!("{}.{}", domain, object),
                attribute: attribute.to_string(),
            },
        );
        entries.push((path.clone(), ReferenceValue::pending(path.as_str()).into()));
    }
}

/// Pending references for one layer. A binding to an entity shares its
/// reference with the entity id's own entry, so resolving either resolves both.
fn cycle_entries(
    bindings: &BTreeMap<String, Binding>,
    dependencies: &BTreeSet<String>,
) -> Vec<(String, ContextValue)> {
    let mut shared: HashMap<&str, ReferenceValue> = HashMap::new();
    let mut entries = Vec::new();

    for (name, binding) in bindings {
        let reference = match binding {
            Binding::Entity(id) => shared
                .entry(id.as_str())
                .or_insert_with(|| ReferenceValue::pending(id.as_str()))
                .clone(),
            _ => ReferenceValue::pending(name.as_str()),
        };
        entries.push((name.clone(), reference.into()));
    }

    for dependency in dependencies {
        if bindings.contains_key(dependency) {
            continue;
        }
        let reference = shared
            .remove(dependency.as_str())
            .unwrap_or_else(|| ReferenceValue::pending(dependency.as_str()));
        entries.push((dependency.clone(), reference.into()));
    }

    entries
}
