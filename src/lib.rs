//! Syneval - dependency-aware formula evaluation
//!
//! Formulas are small arithmetic/logical expressions over named variables,
//! dotted entity references (`sensor.kitchen_temp`) and built-in functions.
//! The engine extracts dependencies, orders subjects so every formula sees
//! its dependencies' current values, detects circular references, and
//! evaluates each subject inside its own layered context with lazy
//! resolution of external state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use syneval::{Binding, EngineConfig, FormulaEngine, InMemoryState, Subject};
//!
//! let state = Arc::new(InMemoryState::new());
//! state.set("external.x", 3);
//! state.set("external.y", 4);
//!
//! let engine = FormulaEngine::new(EngineConfig::default(), state);
//! engine
//!     .register_subject(
//!         Subject::new("total", "a + b")
//!             .with_variable("a", Binding::entity("external.x"))
//!             .with_variable("b", Binding::entity("external.y")),
//!     )
//!     .unwrap();
//!
//! let pass = engine.evaluate_all();
//! assert_eq!(pass.value("total"), Some(&7.into()));
//! ```

pub mod analyzer;
pub mod ast;
pub mod cache;
pub mod circular;
pub mod config;
pub mod context;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod graph;
pub mod lexer;
pub mod resolver;
pub mod result_cache;
pub mod state;
pub mod token_parser;

// Re-export commonly used types
pub use analyzer::{FormulaAnalysis, FormulaAnalyzer};
pub use ast::{Expression, Value};
pub use cache::{AstCache, CacheMetricsSnapshot};
pub use circular::CircularReferenceDetector;
pub use config::{CacheConfig, EngineConfig};
pub use context::{ContextValue, EvaluationContext, InfraValue, ReferenceValue};
pub use dependency::{Binding, DependencyExtractor, DependencyValidator};
pub use engine::{
    AlternateStates, AttributeFormula, EvaluationPass, FormulaEngine, Subject, SubjectEvaluation,
};
pub use error::EngineError;
pub use evaluator::{Evaluator, ExpressionEvaluator, Scope};
pub use graph::{CrossEntityDependencyManager, DependencyGraph, EvaluationOrder};
pub use resolver::{LazyResolver, ResolutionStrategy};
pub use result_cache::ResultCache;
pub use state::{InMemoryState, StateProvider};

/// Syneval version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse formula text into an expression tree, without caching
pub fn parse_formula(formula: &str) -> Result<Expression, EngineError> {
    token_parser::parse(formula).map_err(|e| EngineError::from_syntax(formula, &e))
}
