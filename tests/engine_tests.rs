//! End-to-end tests for the formula engine

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use syneval::{
    AlternateStates, AttributeFormula, Binding, EngineConfig, EngineError, FormulaAnalyzer,
    FormulaEngine, InMemoryState, ResultCache, Subject, Value,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(values: &[(&str, Value)]) -> (Arc<InMemoryState>, FormulaEngine) {
    init_tracing();
    let state = Arc::new(InMemoryState::new());
    for (name, value) in values {
        state.set(*name, value.clone());
    }
    let engine = FormulaEngine::new(EngineConfig::default(), state.clone());
    (state, engine)
}

fn sum_subject() -> Subject {
    Subject::new("total", "a + b")
        .with_variable("a", Binding::entity("external.x"))
        .with_variable("b", Binding::entity("external.y"))
}

#[test]
fn test_entity_bindings_follow_state_changes() {
    let (state, engine) = setup(&[("external.x", Value::Int(3)), ("external.y", Value::Int(4))]);
    engine.register_subject(sum_subject()).unwrap();

    let pass = engine.evaluate_all();
    assert_eq!(pass.order, vec!["total".to_string()]);
    assert_eq!(pass.value("total"), Some(&Value::Int(7)));

    state.set("external.x", 5);
    assert!(engine.invalidate("total") > 0);

    let pass = engine.evaluate_all();
    assert_eq!(pass.value("total"), Some(&Value::Int(9)));
    assert_eq!(engine.computed_value("total"), Some(Value::Int(9)));
}

#[test]
fn test_repeated_evaluation_hits_result_cache() {
    let (_, engine) = setup(&[("external.x", Value::Int(3)), ("external.y", Value::Int(4))]);
    engine.register_subject(sum_subject()).unwrap();

    let first = engine.evaluate("total").unwrap();
    let second = engine.evaluate("total").unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(second.value, Value::Int(7));
    assert_eq!(engine.result_cache().metrics_snapshot().hits, 1);
}

#[test]
fn test_subjects_are_ordered_across_aliases() {
    let (_, engine) = setup(&[("external.x", Value::Int(3)), ("external.y", Value::Int(4))]);
    // registered before the subject it depends on
    engine
        .register_subject(Subject::new("double", "sensor.base_total * 2"))
        .unwrap();
    engine
        .register_subject(sum_subject().with_entity_id("sensor.base_total"))
        .unwrap();

    let pass = engine.evaluate_all();
    assert_eq!(pass.order, vec!["total".to_string(), "double".to_string()]);
    assert_eq!(pass.value("double"), Some(&Value::Int(14)));
    assert_eq!(engine.computed_value("sensor.base_total"), Some(Value::Int(7)));
}

#[test]
fn test_cycles_are_reported_without_blocking_others() {
    let (_, engine) = setup(&[]);
    engine.register_subject(Subject::new("a", "b + 1")).unwrap();
    engine.register_subject(Subject::new("b", "a + 1")).unwrap();
    engine.register_subject(Subject::new("c", "5")).unwrap();
    engine.register_subject(Subject::new("d", "a * 2")).unwrap();

    let pass = engine.evaluate_all();
    assert_eq!(pass.order, vec!["c".to_string()]);
    assert_eq!(pass.value("c"), Some(&Value::Int(5)));

    for id in ["a", "b", "d"] {
        assert!(pass.cyclic.contains(&id.to_string()), "{} should be cyclic", id);
        match pass.error(id) {
            Some(EngineError::CircularDependency { path }) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected circular dependency for {}, got {:?}", id, other),
        }
    }
    assert_eq!(engine.computed_value("a"), None);

    let validation = engine.validate_dependencies();
    assert!(!validation.is_valid);
    assert_eq!(validation.cycles.len(), 1);
}

#[test]
fn test_missing_dependency() {
    let (_, engine) = setup(&[]);
    engine
        .register_subject(Subject::new("ghostly", "sensor.ghost + 1"))
        .unwrap();

    match engine.evaluate("ghostly") {
        Err(EngineError::MissingDependency { subject, names }) => {
            assert_eq!(subject, "ghostly");
            assert!(names.iter().any(|n| n == "sensor.ghost"));
        }
        other => panic!("expected missing dependency, got {:?}", other),
    }

    let validation = engine.validate_dependencies();
    assert!(validation.unregistered.contains("sensor.ghost"));
}

#[test]
fn test_unavailable_dependency_uses_alternate_state() {
    let (state, engine) = setup(&[("sensor.a", Value::Int(1))]);
    state.set_unavailable("sensor.b");

    engine
        .register_subject(
            Subject::new("strict", "x + y")
                .with_variable("x", Binding::entity("sensor.a"))
                .with_variable("y", Binding::entity("sensor.b")),
        )
        .unwrap();
    engine
        .register_subject(
            Subject::new("lenient", "x + y")
                .with_variable("x", Binding::entity("sensor.a"))
                .with_variable("y", Binding::entity("sensor.b"))
                .with_alternate_states(AlternateStates {
                    unavailable: Some(Value::Int(0)),
                    none: None,
                }),
        )
        .unwrap();

    assert!(matches!(
        engine.evaluate("strict"),
        Err(EngineError::UnavailableDependency { .. })
    ));
    assert_eq!(engine.evaluate("lenient").unwrap().value, Value::Int(0));

    state.set("sensor.b", 2);
    assert_eq!(engine.evaluate("strict").unwrap().value, Value::Int(3));
}

#[test]
fn test_none_result_uses_alternate_state() {
    let (_, engine) = setup(&[("sensor.level", Value::Int(-4))]);
    engine
        .register_subject(
            Subject::new("positive", "sensor.level if sensor.level > 0 else None")
                .with_alternate_states(AlternateStates {
                    unavailable: None,
                    none: Some(Value::from("idle")),
                }),
        )
        .unwrap();

    assert_eq!(engine.evaluate("positive").unwrap().value, Value::from("idle"));
}

#[test]
fn test_attributes_see_main_result_as_state() {
    let (_, engine) = setup(&[("sensor.voltage", Value::Int(230)), ("sensor.current", Value::Int(2))]);
    engine
        .register_subject(
            Subject::new("power", "voltage * current")
                .with_variable("voltage", Binding::entity("sensor.voltage"))
                .with_variable("current", Binding::entity("sensor.current"))
                .with_attribute("kilowatts", AttributeFormula::new("state / 1000"))
                .with_attribute("per_volt", AttributeFormula::new("state / voltage"))
                .with_attribute(
                    "scaled",
                    AttributeFormula::new("state * factor").with_variable("factor", Binding::literal(3)),
                )
                .with_attribute("broken", AttributeFormula::new("state + sensor.nowhere")),
        )
        .unwrap();

    let result = engine.evaluate("power").unwrap();
    assert_eq!(result.value, Value::Int(460));
    assert_eq!(result.attributes["kilowatts"], Ok(Value::Float(0.46)));
    assert_eq!(result.attributes["per_volt"], Ok(Value::Float(2.0)));
    assert_eq!(result.attributes["scaled"], Ok(Value::Int(1380)));
    assert!(matches!(
        result.attributes["broken"],
        Err(EngineError::MissingDependency { .. })
    ));

    // attribute layers never leak into the subject's context
    let context = engine.context("power").unwrap();
    let ctx = context.lock().unwrap();
    assert_eq!(ctx.depth(), 1);
    assert!(!ctx.contains("factor"));
}

#[test]
fn test_nested_formula_bindings() {
    let (_, engine) = setup(&[("sensor.a", Value::Int(1))]);
    engine
        .register_subject(
            Subject::new("chain", "x + 1")
                .with_variable("x", Binding::formula("y * 2"))
                .with_variable("y", Binding::formula("sensor.a + 1")),
        )
        .unwrap();
    assert_eq!(engine.evaluate("chain").unwrap().value, Value::Int(5));

    engine
        .register_subject(
            Subject::new("loop", "x")
                .with_variable("x", Binding::formula("y + 1"))
                .with_variable("y", Binding::formula("x + 1")),
        )
        .unwrap();
    assert!(matches!(
        engine.evaluate("loop"),
        Err(EngineError::CircularDependency { .. })
    ));
}

#[test]
fn test_caller_supplied_and_literal_bindings() {
    let domains = EngineConfig::default().entity_domains;
    let (_, engine) = setup(&[]);
    engine
        .register_subject(
            Subject::new("discounted", "price * (1 - rate)")
                .with_variable("price", Binding::CallerSupplied)
                .with_variable("rate", Binding::parse("0.25", &domains)),
        )
        .unwrap();

    let result = engine
        .evaluate_with("discounted", HashMap::from([("price".to_string(), Value::Int(80))]))
        .unwrap();
    assert_eq!(result.value, Value::Float(60.0));
}

#[test]
fn test_parse_errors_surface_per_subject() {
    let (_, engine) = setup(&[]);
    engine.register_subject(Subject::new("bad", "1 +")).unwrap();
    engine.register_subject(Subject::new("good", "1 + 1")).unwrap();

    let pass = engine.evaluate_all();
    assert!(matches!(pass.error("bad"), Some(EngineError::Parse { .. })));
    colored::control::set_override(false);
    let diagnostic = pass.error("bad").unwrap().render();
    assert!(diagnostic.contains("| 1 +"), "{}", diagnostic);
    assert_eq!(pass.value("good"), Some(&Value::Int(2)));
    assert_eq!(pass.succeeded(), 1);
    assert_eq!(pass.failed(), 1);
}

#[test]
fn test_engines_can_share_caches() {
    init_tracing();
    let config = EngineConfig::default();
    let analyzer = Arc::new(FormulaAnalyzer::new(&config));
    let results = Arc::new(ResultCache::new(&config.cache));

    let state = Arc::new(InMemoryState::new());
    state.set("external.x", 3);
    state.set("external.y", 4);

    let first = FormulaEngine::with_shared_caches(
        config.clone(),
        state.clone(),
        analyzer.clone(),
        results.clone(),
    );
    let second = FormulaEngine::with_shared_caches(config, state, analyzer.clone(), results);
    first.register_subject(sum_subject()).unwrap();
    second.register_subject(sum_subject()).unwrap();

    assert!(!first.evaluate("total").unwrap().from_cache);
    assert!(second.evaluate("total").unwrap().from_cache);
    assert!(analyzer.cached_analyses() > 0);
}

#[test]
fn test_remove_subject() {
    let (_, engine) = setup(&[("external.x", Value::Int(3)), ("external.y", Value::Int(4))]);
    engine.register_subject(sum_subject()).unwrap();
    engine.evaluate("total").unwrap();

    assert!(engine.remove_subject("total"));
    assert!(!engine.remove_subject("total"));
    assert_eq!(engine.computed_value("total"), None);
    assert!(engine.context("total").is_none());
    assert!(engine.subject_ids().is_empty());
}

#[test]
fn test_concurrent_evaluation_of_distinct_subjects() {
    let (_, engine) = setup(&[("sensor.base", Value::Int(10))]);
    for i in 0..8 {
        engine
            .register_subject(Subject::new(format!("s{}", i), format!("sensor.base + {}", i)))
            .unwrap();
    }

    std::thread::scope(|scope| {
        for i in 0..8 {
            let engine = &engine;
            scope.spawn(move || {
                let id = format!("s{}", i);
                for _ in 0..20 {
                    assert_eq!(engine.evaluate(&id).unwrap().value, Value::Int(10 + i));
                }
            });
        }
    });

    assert_eq!(engine.subject_ids().len(), 8);
}

#[test]
fn test_failed_evaluation_leaves_context_reusable() {
    let (state, engine) = setup(&[("sensor.divisor", Value::Int(0))]);
    engine
        .register_subject(
            Subject::new("ratio", "1 / d").with_variable("d", Binding::entity("sensor.divisor")),
        )
        .unwrap();

    assert!(matches!(
        engine.evaluate("ratio"),
        Err(EngineError::Evaluation { .. })
    ));
    {
        let context = engine.context("ratio").unwrap();
        let ctx = context.lock().unwrap();
        assert_eq!(ctx.depth(), 1);
    }

    state.set("sensor.divisor", 4);
    assert_eq!(engine.evaluate("ratio").unwrap().value, Value::Float(0.25));
    assert_eq!(engine.context("ratio").unwrap().lock().unwrap().depth(), 1);
}

#[test]
fn test_integer_extremes_evaluate_without_panicking() {
    let (_, engine) = setup(&[]);
    let cases = [
        ("floor_div", "m // -1", Value::Float(9.223372036854775808e18)),
        ("modulo", "m % -1", Value::Int(0)),
        ("absolute", "abs(m)", Value::Float(9.223372036854775808e18)),
        ("large_mod", "9223372036854775806 % 9223372036854775807", Value::Int(i64::MAX - 1)),
    ];
    for (id, formula, _) in &cases {
        engine
            .register_subject(Subject::new(*id, *formula).with_variable("m", Binding::literal(i64::MIN)))
            .unwrap();
    }

    for (id, _, expected) in cases {
        assert_eq!(engine.evaluate(id).unwrap().value, expected, "{}", id);
        assert_eq!(engine.context(id).unwrap().lock().unwrap().depth(), 1);
    }
}

#[test]
fn test_entity_attribute_paths_read_attributes() {
    let (state, engine) = setup(&[("sensor.battery", Value::Int(80))]);
    engine
        .register_subject(Subject::new("reserve", "sensor.battery.level * 2"))
        .unwrap();
    engine
        .register_subject(Subject::new("charge", "sensor.battery").with_attribute(
            "doubled",
            AttributeFormula::new("sensor.battery.level + state"),
        ))
        .unwrap();

    match engine.evaluate("reserve") {
        Err(EngineError::Evaluation { message, .. }) => {
            assert!(message.contains("sensor.battery.level"), "{}", message)
        }
        other => panic!("expected evaluation error, got {:?}", other),
    }

    state.set_attribute("sensor.battery", "level", 42);
    assert_eq!(engine.evaluate("reserve").unwrap().value, Value::Int(84));

    let charge = engine.evaluate("charge").unwrap();
    assert_eq!(charge.value, Value::Int(80));
    assert_eq!(charge.attributes.get("doubled"), Some(&Ok(Value::Int(122))));
}
