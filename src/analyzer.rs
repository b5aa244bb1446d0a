//! Formula analysis
//!
//! Parses each distinct formula text once and extracts what the rest of the
//! engine needs to know about it: plain variables, `domain.identifier` entity
//! references, function calls and the privileged `state` / `self` tokens.
//! Analyses are cached by exact formula text until [`FormulaAnalyzer::clear_cache`].

use crate::ast::Expression;
use crate::cache::{AstCache, CacheMetrics, CacheMetricsSnapshot, ParseOutcome};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::token_parser;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Token resolving to the subject's own state (or the main result, inside attributes)
pub const STATE_TOKEN: &str = "state";
/// Token resolving to the subject itself
pub const SELF_TOKEN: &str = "self";

lazy_static! {
    /// Shape of an entity id: `domain.object_id`
    static ref ENTITY_ID_PATTERN: Regex =
        Regex::new(r"^([a-z_][a-z0-9_]*)\.([a-z0-9_]+)$").expect("entity id pattern is valid");
}

/// A function call found in a formula, with its arguments rendered as text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<String>,
}

/// Immutable result of analyzing one formula
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormulaAnalysis {
    pub variables: BTreeSet<String>,
    pub entity_references: BTreeSet<String>,
    /// Attribute paths on entities, e.g. `sensor.battery.level`
    #[serde(default)]
    pub attribute_references: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub function_calls: Vec<FunctionCall>,
    pub has_self_token: bool,
    pub has_state_token: bool,
}

impl FormulaAnalysis {
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
            && self.function_calls.is_empty()
            && !self.has_self_token
            && !self.has_state_token
    }
}

/// Check whether `name` has the `domain.identifier` shape with a domain in `domains`
pub fn is_entity_id(name: &str, domains: &BTreeSet<String>) -> bool {
    ENTITY_ID_PATTERN
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|domain| domains.contains(domain.as_str()))
        .unwrap_or(false)
}

/// Parses and analyzes formulas, caching both steps
pub struct FormulaAnalyzer {
    domains: BTreeSet<String>,
    ast_cache: AstCache,
    analyses: RwLock<HashMap<String, Arc<FormulaAnalysis>>>,
    metrics: CacheMetrics,
}

impl FormulaAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_domains(config.entity_domains.clone(), config.ast_cache_size)
    }

    pub fn with_domains(domains: BTreeSet<String>, ast_cache_size: usize) -> Self {
        Self {
            domains,
            ast_cache: AstCache::new(ast_cache_size),
            analyses: RwLock::new(HashMap::new()),
            metrics: CacheMetrics::default(),
        }
    }

    /// Recognized entity domains
    pub fn domains(&self) -> &BTreeSet<String> {
        &self.domains
    }

    /// Whether `name` is an entity-like reference
    pub fn is_entity_reference(&self, name: &str) -> bool {
        is_entity_id(name, &self.domains)
    }

    /// Parse a formula, served from the parse cache when possible
    pub fn parse(&self, formula: &str) -> Arc<ParseOutcome> {
        self.ast_cache.get_or_parse(formula, |text| {
            token_parser::parse(text).map_err(|e| EngineError::from_syntax(text, &e))
        })
    }

    /// Analyze a formula. Never fails: blank formulas give an empty analysis,
    /// malformed ones are logged and also give an empty analysis.
    pub fn analyze(&self, formula: &str) -> Arc<FormulaAnalysis> {
        {
            let analyses = self.analyses.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(analysis) = analyses.get(formula) {
                self.metrics.record_hit();
                return Arc::clone(analysis);
            }
        }

        self.metrics.record_miss();
        let analysis = Arc::new(self.analyze_uncached(formula));

        self.analyses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(formula.to_string())
            .or_insert_with(|| Arc::clone(&analysis));

        analysis
    }

    fn analyze_uncached(&self, formula: &str) -> FormulaAnalysis {
        if formula.trim().is_empty() {
            return FormulaAnalysis::default();
        }

        let outcome = self.parse(formula);
        let expr = match outcome.as_ref() {
            Ok(expr) => expr,
            Err(e) => {
                warn!(formula, error = %e, "formula could not be parsed; dependency analysis degraded");
                return FormulaAnalysis::default();
            }
        };

        let mut collector = Collector::default();
        self.visit(expr, &mut collector);

        let Collector {
            mut analysis,
            call_names,
        } = collector;

        // Names used as call targets are functions, not variables
        analysis.variables.retain(|name| !call_names.contains(name));
        analysis.dependencies = analysis
            .variables
            .iter()
            .chain(analysis.entity_references.iter())
            .cloned()
            .collect();

        debug!(
            formula,
            dependencies = analysis.dependencies.len(),
            "analyzed formula"
        );
        analysis
    }

    fn visit(&self, expr: &Expression, collector: &mut Collector) {
        match expr {
            Expression::Literal { .. } => {}
            Expression::Variable { name, .. } => collector.name(name),
            Expression::MemberAccess { object, .. } => {
                if let Some(path) = expr.dotted_path() {
                    let root = path[0];
                    if self.domains.contains(root) {
                        // `sensor.x` or `sensor.x.attribute`: the entity is the first two segments
                        collector
                            .analysis
                            .entity_references
                            .insert(format!("{}.{}", root, path[1]));
                        if path.len() > 2 {
                            collector
                                .analysis
                                .attribute_references
                                .insert(path.join("."));
                        }
                        return;
                    }
                }
                self.visit(object, collector);
            }
            Expression::FunctionCall { name, args, .. } => {
                collector.call_names.insert(name.clone());
                collector.analysis.function_calls.push(FunctionCall {
                    name: name.clone(),
                    args: args.iter().map(|a| a.to_string()).collect(),
                });
                for arg in args {
                    self.visit(arg, collector);
                }
            }
            Expression::BinaryOp { left, right, .. } => {
                self.visit(left, collector);
                self.visit(right, collector);
            }
            Expression::UnaryOp { operand, .. } => self.visit(operand, collector),
            Expression::Conditional {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                self.visit(condition, collector);
                self.visit(then_expr, collector);
                self.visit(else_expr, collector);
            }
        }
    }

    /// Drop every cached parse and analysis
    pub fn clear_cache(&self) {
        self.ast_cache.clear();
        self.analyses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drop cached state for a single formula text
    pub fn invalidate(&self, formula: &str) {
        self.ast_cache.remove(formula);
        self.analyses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(formula);
    }

    /// Number of cached analyses
    pub fn cached_analyses(&self) -> usize {
        self.analyses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Analysis cache metrics
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Parse cache metrics
    pub fn parse_metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.ast_cache.metrics_snapshot()
    }
}

impl Default for FormulaAnalyzer {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

#[derive(Default)]
struct Collector {
    analysis: FormulaAnalysis,
    call_names: HashSet<String>,
}

impl Collector {
    fn name(&mut self, name: &str) {
        match name {
            STATE_TOKEN => self.analysis.has_state_token = true,
            SELF_TOKEN => self.analysis.has_self_token = true,
            _ => {
                self.analysis.variables.insert(name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_variables_and_entities() {
        let analyzer = FormulaAnalyzer::default();
        let analysis = analyzer.analyze("a + sensor.kitchen_temp * b - sensor.kitchen_temp");

        assert_eq!(analysis.variables, set(&["a", "b"]));
        assert_eq!(analysis.entity_references, set(&["sensor.kitchen_temp"]));
        assert_eq!(
            analysis.dependencies,
            set(&["a", "b", "sensor.kitchen_temp"])
        );
    }

    #[test]
    fn test_entity_attribute_access() {
        let analyzer = FormulaAnalyzer::default();
        let analysis = analyzer.analyze("sensor.battery.level + device.power");

        assert_eq!(analysis.entity_references, set(&["sensor.battery"]));
        assert_eq!(analysis.attribute_references, set(&["sensor.battery.level"]));
        assert_eq!(analysis.dependencies, set(&["device", "sensor.battery"]));
        // `device` is not a known domain: attribute access on a variable
        assert_eq!(analysis.variables, set(&["device"]));
    }

    #[test]
    fn test_special_tokens_are_not_dependencies() {
        let analyzer = FormulaAnalyzer::default();
        let analysis = analyzer.analyze("state * 2 + self + x");

        assert!(analysis.has_state_token);
        assert!(analysis.has_self_token);
        assert_eq!(analysis.dependencies, set(&["x"]));
    }

    #[test]
    fn test_function_names_are_not_variables() {
        let analyzer = FormulaAnalyzer::default();
        let analysis = analyzer.analyze("max(a, 10) + round(b, 2) + max");

        assert_eq!(analysis.variables, set(&["a", "b"]));
        assert_eq!(
            analysis.function_calls,
            vec![
                FunctionCall {
                    name: "max".into(),
                    args: vec!["a".into(), "10".into()],
                },
                FunctionCall {
                    name: "round".into(),
                    args: vec!["b".into(), "2".into()],
                },
            ]
        );
    }

    #[test]
    fn test_string_literals_are_not_variables() {
        let analyzer = FormulaAnalyzer::default();
        let analysis = analyzer.analyze("'on' if status == 'sensor.fake' else off_value");

        assert_eq!(analysis.variables, set(&["off_value", "status"]));
        assert!(analysis.entity_references.is_empty());
    }

    #[test]
    fn test_blank_and_malformed_formulas_degrade() {
        let analyzer = FormulaAnalyzer::default();
        assert!(analyzer.analyze("").is_empty());
        assert!(analyzer.analyze("   ").is_empty());
        assert!(analyzer.analyze("a + * b").is_empty());
        assert!(analyzer.parse("a + * b").is_err());
    }

    #[test]
    fn test_idempotent_analysis_served_from_cache() {
        let analyzer = FormulaAnalyzer::default();
        let first = analyzer.analyze("x + y");
        let second = analyzer.analyze("x + y");

        assert_eq!(*first, *second);
        assert!(Arc::ptr_eq(&first, &second));

        let metrics = analyzer.metrics_snapshot();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(analyzer.parse_metrics_snapshot().misses, 1);
    }

    #[test]
    fn test_clear_cache_forces_reparse() {
        let analyzer = FormulaAnalyzer::default();
        analyzer.analyze("x + 1");
        analyzer.clear_cache();
        assert_eq!(analyzer.cached_analyses(), 0);

        analyzer.analyze("x + 1");
        assert_eq!(analyzer.parse_metrics_snapshot().misses, 2);
    }

    #[test]
    fn test_entity_id_shape() {
        let analyzer = FormulaAnalyzer::default();
        assert!(analyzer.is_entity_reference("sensor.power"));
        assert!(analyzer.is_entity_reference("external.x"));
        assert!(!analyzer.is_entity_reference("power"));
        assert!(!analyzer.is_entity_reference("unknown_domain.power"));
        assert!(!analyzer.is_entity_reference("Sensor.Power"));
    }
}
