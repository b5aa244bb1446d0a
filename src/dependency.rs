//! Dependency extraction and validation
//!
//! Turns a formula analysis plus the subject's declared variable bindings into
//! a dependency set, and classifies each dependency after resolution as
//! satisfied, missing, unavailable or pending runtime resolution.

use crate::analyzer::{is_entity_id, FormulaAnalyzer};
use crate::ast::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// How a declared variable obtains its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Current value of an externally managed entity (or another subject)
    Entity(String),
    /// Fixed value
    Literal(Value),
    /// Nested computed variable, evaluated before the formula that uses it
    Formula(String),
    /// Supplied by the caller at evaluation time
    CallerSupplied,
}

impl Binding {
    /// Classify a configuration string: entity ids become [`Binding::Entity`],
    /// numbers and booleans become literals, anything else is a formula.
    pub fn parse(text: &str, domains: &BTreeSet<String>) -> Binding {
        let trimmed = text.trim();

        if let Ok(i) = trimmed.parse::<i64>() {
            return Binding::Literal(Value::Int(i));
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Binding::Literal(Value::Float(f));
        }
        match trimmed {
            "True" | "true" => return Binding::Literal(Value::Bool(true)),
            "False" | "false" => return Binding::Literal(Value::Bool(false)),
            _ => {}
        }
        if is_entity_id(trimmed, domains) {
            return Binding::Entity(trimmed.to_string());
        }
        Binding::Formula(trimmed.to_string())
    }

    pub fn entity(id: impl Into<String>) -> Self {
        Binding::Entity(id.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Binding::Literal(value.into())
    }

    pub fn formula(text: impl Into<String>) -> Self {
        Binding::Formula(text.into())
    }
}

/// Extracts dependency sets using a shared analyzer
pub struct DependencyExtractor<'a> {
    analyzer: &'a FormulaAnalyzer,
}

impl<'a> DependencyExtractor<'a> {
    pub fn new(analyzer: &'a FormulaAnalyzer) -> Self {
        Self { analyzer }
    }

    /// Union of the formula's own dependencies and whatever its declared
    /// bindings pull in: bound entity ids and the dependencies of nested
    /// formula bindings. Attribute formulas are never passed here, so they
    /// cannot couple into the main formula's ordering.
    pub fn extract(&self, formula: &str, bindings: &BTreeMap<String, Binding>) -> BTreeSet<String> {
        let mut dependencies = BTreeSet::new();
        let mut visited = HashSet::new();
        self.collect(formula, bindings, &mut visited, &mut dependencies);

        for binding in bindings.values() {
            match binding {
                Binding::Entity(id) => {
                    dependencies.insert(id.clone());
                }
                Binding::Formula(text) => {
                    self.collect(text, bindings, &mut visited, &mut dependencies);
                }
                Binding::Literal(_) | Binding::CallerSupplied => {}
            }
        }

        dependencies
    }

    /// Dependencies that must come from outside the subject: the extracted
    /// set minus names satisfied by a local binding.
    pub fn external_dependencies(
        &self,
        formula: &str,
        bindings: &BTreeMap<String, Binding>,
    ) -> BTreeSet<String> {
        let mut dependencies = self.extract(formula, bindings);
        dependencies.retain(|name| !bindings.contains_key(name));
        dependencies
    }

    fn collect(
        &self,
        formula: &str,
        bindings: &BTreeMap<String, Binding>,
        visited: &mut HashSet<String>,
        out: &mut BTreeSet<String>,
    ) {
        if !visited.insert(formula.to_string()) {
            return;
        }

        let analysis = self.analyzer.analyze(formula);
        for name in &analysis.dependencies {
            out.insert(name.clone());
            if let Some(Binding::Formula(text)) = bindings.get(name) {
                self.collect(text, bindings, visited, out);
            }
        }
    }
}

/// Inputs for one validation call
#[derive(Debug, Clone, Copy)]
pub struct DependencyQuery<'a> {
    pub formula_name: &'a str,
    pub dependencies: &'a BTreeSet<String>,
    /// Names registered with the state provider
    pub known_entities: &'a HashSet<String>,
    /// Subject ids and aliases computed by the engine
    pub subject_registry: &'a HashSet<String>,
}

/// Classification of a dependency set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyValidation {
    /// Domain-qualified names nobody knows about
    pub missing: BTreeSet<String>,
    /// Known names without a current value
    pub unavailable: BTreeSet<String>,
    /// Bare names left to runtime resolution
    pub unknown: BTreeSet<String>,
}

impl DependencyValidation {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty() && self.unavailable.is_empty()
    }
}

/// Validates dependency sets against live values and known names
#[derive(Debug, Clone)]
pub struct DependencyValidator {
    domains: BTreeSet<String>,
}

impl DependencyValidator {
    pub fn new(domains: BTreeSet<String>) -> Self {
        Self { domains }
    }

    /// Classify each dependency of `query`. `resolved` holds the values
    /// present in the live context after resolution (`None` for names that
    /// resolved to nothing).
    pub fn validate(
        &self,
        query: &DependencyQuery<'_>,
        resolved: &HashMap<String, Option<Value>>,
    ) -> DependencyValidation {
        let mut validation = DependencyValidation::default();

        for name in query.dependencies {
            if matches!(resolved.get(name), Some(Some(_))) {
                continue;
            }

            let known =
                query.known_entities.contains(name) || query.subject_registry.contains(name);
            if known {
                validation.unavailable.insert(name.clone());
            } else if name.contains('.') || is_entity_id(name, &self.domains) {
                validation.missing.insert(name.clone());
            } else {
                validation.unknown.insert(name.clone());
            }
        }

        tracing::debug!(
            formula = query.formula_name,
            missing = validation.missing.len(),
            unavailable = validation.unavailable.len(),
            unknown = validation.unknown.len(),
            "validated dependencies"
        );
        validation
    }
}
