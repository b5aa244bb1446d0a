//! Built-in functions available to formulas
//!
//! Numeric arguments accept numeric strings, since external states are
//! commonly reported as text.

use crate::ast::Value;
use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// Function signature
pub type BuiltinFunction = fn(&[Value]) -> Result<Value>;

/// Function registry
pub struct FunctionRegistry {
    functions: HashMap<String, BuiltinFunction>,
}

impl FunctionRegistry {
    /// Create a new function registry with all built-in functions
    pub fn new() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };

        // Numeric functions
        registry.register("abs", fn_abs);
        registry.register("min", fn_min);
        registry.register("max", fn_max);
        registry.register("round", fn_round);
        registry.register("floor", fn_floor);
        registry.register("ceil", fn_ceil);
        registry.register("sqrt", fn_sqrt);
        registry.register("pow", fn_pow);
        registry.register("clamp", fn_clamp);

        // Aggregates
        registry.register("sum", fn_sum);
        registry.register("avg", fn_avg);
        registry.register("mean", fn_avg); // Alias for avg

        // Type conversion
        registry.register("float", fn_float);
        registry.register("int", fn_int);
        registry.register("str", fn_str);

        registry
    }

    /// Register a function
    pub fn register(&mut self, name: &str, func: BuiltinFunction) {
        self.functions.insert(name.to_string(), func);
    }

    /// Call a function
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.functions.get(name) {
            Some(func) => func(args),
            None => Err(anyhow!("Unknown function: {}", name)),
        }
    }

    /// Check if a function exists
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// List all function names, sorted
    pub fn list_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Read-only built-in registry shared by every evaluator
lazy_static::lazy_static! {
    static ref BUILTINS: FunctionRegistry = FunctionRegistry::new();
}

/// The built-in registry
pub fn builtins() -> &'static FunctionRegistry {
    &BUILTINS
}

/// Call a built-in function by name
pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    BUILTINS.call(name, args)
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_args(args: &[Value], count: usize, name: &str) -> Result<()> {
    if args.len() != count {
        return Err(anyhow!(
            "{}() expects {} argument(s), got {}",
            name,
            count,
            args.len()
        ));
    }
    Ok(())
}

fn require_args_min(args: &[Value], min: usize, name: &str) -> Result<()> {
    if args.len() < min {
        return Err(anyhow!(
            "{}() expects at least {} argument(s), got {}",
            name,
            min,
            args.len()
        ));
    }
    Ok(())
}

fn as_number(value: &Value, name: &str) -> Result<f64> {
    value
        .as_number()
        .ok_or_else(|| anyhow!("{}() expected a number, got {} {}", name, value.type_name(), value))
}

fn all_ints(args: &[Value]) -> bool {
    args.iter().all(|v| matches!(v, Value::Int(_)))
}

// =============================================================================
// NUMERIC FUNCTIONS
// =============================================================================

fn fn_abs(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "abs")?;
    match &args[0] {
        Value::Int(i) => Ok(i
            .checked_abs()
            .map(Value::Int)
            .unwrap_or(Value::Float((*i as f64).abs()))),
        other => Ok(Value::Float(as_number(other, "abs")?.abs())),
    }
}

fn fn_min(args: &[Value]) -> Result<Value> {
    require_args_min(args, 1, "min")?;
    if all_ints(args) {
        let min = args.iter().filter_map(Value::as_int).min();
        return min.map(Value::Int).ok_or_else(|| anyhow!("min() of nothing"));
    }
    let mut min = f64::INFINITY;
    for val in args {
        min = min.min(as_number(val, "min")?);
    }
    Ok(Value::Float(min))
}

fn fn_max(args: &[Value]) -> Result<Value> {
    require_args_min(args, 1, "max")?;
    if all_ints(args) {
        let max = args.iter().filter_map(Value::as_int).max();
        return max.map(Value::Int).ok_or_else(|| anyhow!("max() of nothing"));
    }
    let mut max = f64::NEG_INFINITY;
    for val in args {
        max = max.max(as_number(val, "max")?);
    }
    Ok(Value::Float(max))
}

fn fn_round(args: &[Value]) -> Result<Value> {
    match args.len() {
        1 => {
            let num = as_number(&args[0], "round")?;
            Ok(Value::Int(num.round() as i64))
        }
        2 => {
            let num = as_number(&args[0], "round")?;
            let digits = args[1]
                .as_int()
                .ok_or_else(|| anyhow!("round() digits must be an integer"))?;
            let factor = 10f64.powi(digits as i32);
            Ok(Value::Float((num * factor).round() / factor))
        }
        n => Err(anyhow!("round() expects 1 or 2 argument(s), got {}", n)),
    }
}

fn fn_floor(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "floor")?;
    let num = as_number(&args[0], "floor")?;
    Ok(Value::Int(num.floor() as i64))
}

fn fn_ceil(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "ceil")?;
    let num = as_number(&args[0], "ceil")?;
    Ok(Value::Int(num.ceil() as i64))
}

fn fn_sqrt(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "sqrt")?;
    let num = as_number(&args[0], "sqrt")?;
    if num < 0.0 {
        return Err(anyhow!("sqrt() of negative number {}", num));
    }
    Ok(Value::Float(num.sqrt()))
}

fn fn_pow(args: &[Value]) -> Result<Value> {
    require_args(args, 2, "pow")?;
    let base = as_number(&args[0], "pow")?;
    let exp = as_number(&args[1], "pow")?;
    Ok(Value::Float(base.powf(exp)))
}

fn fn_clamp(args: &[Value]) -> Result<Value> {
    require_args(args, 3, "clamp")?;
    if all_ints(args) {
        if let (Some(v), Some(lo), Some(hi)) = (args[0].as_int(), args[1].as_int(), args[2].as_int()) {
            if lo > hi {
                return Err(anyhow!("clamp() lower bound {} exceeds upper bound {}", lo, hi));
            }
            return Ok(Value::Int(v.clamp(lo, hi)));
        }
    }
    let v = as_number(&args[0], "clamp")?;
    let lo = as_number(&args[1], "clamp")?;
    let hi = as_number(&args[2], "clamp")?;
    if lo > hi {
        return Err(anyhow!("clamp() lower bound {} exceeds upper bound {}", lo, hi));
    }
    Ok(Value::Float(v.clamp(lo, hi)))
}

// =============================================================================
// AGGREGATES
// =============================================================================

fn fn_sum(args: &[Value]) -> Result<Value> {
    if all_ints(args) {
        let mut total: i64 = 0;
        for val in args.iter().filter_map(Value::as_int) {
            total = total
                .checked_add(val)
                .ok_or_else(|| anyhow!("sum() overflowed"))?;
        }
        return Ok(Value::Int(total));
    }
    let mut total = 0.0;
    for val in args {
        total += as_number(val, "sum")?;
    }
    Ok(Value::Float(total))
}

fn fn_avg(args: &[Value]) -> Result<Value> {
    require_args_min(args, 1, "avg")?;
    let mut total = 0.0;
    for val in args {
        total += as_number(val, "avg")?;
    }
    Ok(Value::Float(total / args.len() as f64))
}

// =============================================================================
// TYPE CONVERSION FUNCTIONS
// =============================================================================

fn fn_float(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "float")?;
    Ok(Value::Float(as_number(&args[0], "float")?))
}

fn fn_int(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "int")?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        other => Ok(Value::Int(as_number(other, "int")?.trunc() as i64)),
    }
}

fn fn_str(args: &[Value]) -> Result<Value> {
    require_args(args, 1, "str")?;
    Ok(Value::String(args[0].to_string_repr()))
}
