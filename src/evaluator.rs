//! Expression evaluation over a materialized scope
//!
//! The engine only depends on the [`ExpressionEvaluator`] trait; [`Evaluator`]
//! is the default tree-walking implementation.

use crate::ast::{BinaryOperator, Expression, UnaryOperator, Value};
use crate::context::Callable;
use crate::functions::{self, FunctionRegistry};
use anyhow::{anyhow, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Flattened variables and callables handed to an evaluator
#[derive(Clone, Default)]
pub struct Scope {
    values: HashMap<String, Value>,
    callables: HashMap<String, Callable>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn insert_callable(&mut self, name: impl Into<String>, callable: Callable) {
        self.callables.insert(name.into(), callable);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_callable(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Variable values, for fingerprinting
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut callables: Vec<&String> = self.callables.keys().collect();
        callables.sort();
        f.debug_struct("Scope")
            .field("values", &self.values)
            .field("callables", &callables)
            .finish()
    }
}

/// Pluggable expression evaluator
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &Expression, scope: &Scope) -> Result<Value>;
}

/// Default evaluator with Python-like arithmetic
#[derive(Clone, Default)]
pub struct Evaluator {
    functions: Option<Arc<FunctionRegistry>>,
}

impl Evaluator {
    /// Evaluator using the built-in functions
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluator using a custom function registry
    pub fn with_registry(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            functions: Some(registry),
        }
    }

    /// Evaluate an expression
    pub fn evaluate_expression(&self, expr: &Expression, scope: &Scope) -> Result<Value> {
        match expr {
            Expression::Literal { value, .. } => Ok(value.clone()),

            Expression::Variable { name, .. } => scope
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("Undefined variable: {}", name)),

            Expression::MemberAccess { object, field, .. } => {
                // Entity ids and mapping fields are stored under their dotted name
                if let Some(path) = expr.dotted_path() {
                    if let Some(value) = scope.get(&path.join(".")) {
                        return Ok(value.clone());
                    }
                    if scope.contains(path[0]) {
                        let obj = self.evaluate_expression(object, scope)?;
                        return Err(anyhow!(
                            "Cannot access field '{}' on {} value",
                            field,
                            obj.type_name()
                        ));
                    }
                    return Err(anyhow!("Undefined variable: {}", path.join(".")));
                }
                let obj = self.evaluate_expression(object, scope)?;
                Err(anyhow!(
                    "Cannot access field '{}' on {} value",
                    field,
                    obj.type_name()
                ))
            }

            Expression::FunctionCall { name, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate_expression(arg, scope)?);
                }
                self.call_function(name, &values, scope)
            }

            Expression::BinaryOp {
                op: BinaryOperator::And,
                left,
                right,
                ..
            } => {
                let left_val = self.evaluate_expression(left, scope)?;
                if !left_val.is_truthy() {
                    Ok(left_val)
                } else {
                    self.evaluate_expression(right, scope)
                }
            }

            Expression::BinaryOp {
                op: BinaryOperator::Or,
                left,
                right,
                ..
            } => {
                let left_val = self.evaluate_expression(left, scope)?;
                if left_val.is_truthy() {
                    Ok(left_val)
                } else {
                    self.evaluate_expression(right, scope)
                }
            }

            Expression::BinaryOp {
                op, left, right, ..
            } => {
                let left_val = self.evaluate_expression(left, scope)?;
                let right_val = self.evaluate_expression(right, scope)?;
                evaluate_binary_op(*op, left_val, right_val)
            }

            Expression::UnaryOp { op, operand, .. } => {
                let operand_val = self.evaluate_expression(operand, scope)?;
                evaluate_unary_op(*op, operand_val)
            }

            Expression::Conditional {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                let cond_val = self.evaluate_expression(condition, scope)?;
                if cond_val.is_truthy() {
                    self.evaluate_expression(then_expr, scope)
                } else {
                    self.evaluate_expression(else_expr, scope)
                }
            }
        }
    }

    /// Scope callables shadow registry functions
    fn call_function(&self, name: &str, args: &[Value], scope: &Scope) -> Result<Value> {
        if let Some(callable) = scope.get_callable(name) {
            return callable(args);
        }
        match &self.functions {
            Some(registry) => registry.call(name, args),
            None => functions::call_builtin(name, args),
        }
    }
}

impl ExpressionEvaluator for Evaluator {
    fn evaluate(&self, expr: &Expression, scope: &Scope) -> Result<Value> {
        self.evaluate_expression(expr, scope)
    }
}

/// Numeric view of an operand
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn of(value: &Value) -> Option<Number> {
        match value {
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Number::Int)
                    .ok()
                    .or_else(|| s.parse::<f64>().map(Number::Float).ok())
            }
            Value::Null => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

fn operands(op: BinaryOperator, left: &Value, right: &Value) -> Result<(Number, Number)> {
    match (Number::of(left), Number::of(right)) {
        (Some(l), Some(r)) => Ok((l, r)),
        _ => Err(anyhow!(
            "Invalid operands for {}: {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )),
    }
}

fn evaluate_binary_op(op: BinaryOperator, left: Value, right: Value) -> Result<Value> {
    match op {
        BinaryOperator::Add => {
            if let (Value::String(l), Value::String(r)) = (&left, &right) {
                if Number::of(&left).is_none() || Number::of(&right).is_none() {
                    return Ok(Value::String(format!("{}{}", l, r)));
                }
            }
            arithmetic(op, &left, &right, i64::checked_add, |l, r| l + r)
        }
        BinaryOperator::Subtract => arithmetic(op, &left, &right, i64::checked_sub, |l, r| l - r),
        BinaryOperator::Multiply => arithmetic(op, &left, &right, i64::checked_mul, |l, r| l * r),

        BinaryOperator::Divide => {
            let (l, r) = operands(op, &left, &right)?;
            if r.as_f64() == 0.0 {
                return Err(anyhow!("Division by zero"));
            }
            Ok(Value::Float(l.as_f64() / r.as_f64()))
        }

        BinaryOperator::FloorDivide => match operands(op, &left, &right)? {
            (_, r) if r.as_f64() == 0.0 => Err(anyhow!("Division by zero")),
            (Number::Int(l), Number::Int(r)) => match floor_div(l, r) {
                Some(q) => Ok(Value::Int(q)),
                None => Ok(Value::Float((l as f64 / r as f64).floor())),
            },
            (l, r) => Ok(Value::Float((l.as_f64() / r.as_f64()).floor())),
        },

        BinaryOperator::Modulo => match operands(op, &left, &right)? {
            (_, r) if r.as_f64() == 0.0 => Err(anyhow!("Modulo by zero")),
            (Number::Int(l), Number::Int(r)) => Ok(Value::Int(floor_mod(l, r))),
            (l, r) => {
                let (l, r) = (l.as_f64(), r.as_f64());
                Ok(Value::Float(l - r * (l / r).floor()))
            }
        },

        BinaryOperator::Power => match operands(op, &left, &right)? {
            (Number::Int(l), Number::Int(r)) if r >= 0 => match u32::try_from(r)
                .ok()
                .and_then(|exp| l.checked_pow(exp))
            {
                Some(result) => Ok(Value::Int(result)),
                None => Ok(Value::Float((l as f64).powf(r as f64))),
            },
            (l, r) => Ok(Value::Float(l.as_f64().powf(r.as_f64()))),
        },

        BinaryOperator::Equal => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOperator::NotEqual => Ok(Value::Bool(!values_equal(&left, &right))),

        BinaryOperator::LessThan => compare(op, &left, &right).map(|o| Value::Bool(o.is_lt())),
        BinaryOperator::LessThanOrEqual => {
            compare(op, &left, &right).map(|o| Value::Bool(o.is_le()))
        }
        BinaryOperator::GreaterThan => compare(op, &left, &right).map(|o| Value::Bool(o.is_gt())),
        BinaryOperator::GreaterThanOrEqual => {
            compare(op, &left, &right).map(|o| Value::Bool(o.is_ge()))
        }

        // short-circuited by the caller
        BinaryOperator::And => Ok(if left.is_truthy() { right } else { left }),
        BinaryOperator::Or => Ok(if left.is_truthy() { left } else { right }),
    }
}

/// Integer `//` rounding toward negative infinity; `None` on overflow
fn floor_div(l: i64, r: i64) -> Option<i64> {
    let q = l.checked_div(r)?;
    let rem = l.checked_rem(r)?;
    if rem != 0 && (rem < 0) != (r < 0) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

/// Integer `%` taking the sign of the divisor. `r` must be non-zero.
fn floor_mod(l: i64, r: i64) -> i64 {
    // i64::MIN % -1 overflows in checked_rem but is 0
    let rem = l.checked_rem(r).unwrap_or(0);
    if rem != 0 && (rem < 0) != (r < 0) {
        rem + r
    } else {
        rem
    }
}

fn arithmetic(
    op: BinaryOperator,
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    match operands(op, left, right)? {
        (Number::Int(l), Number::Int(r)) => match int_op(l, r) {
            Some(result) => Ok(Value::Int(result)),
            None => Ok(Value::Float(float_op(l as f64, r as f64))),
        },
        (l, r) => Ok(Value::Float(float_op(l.as_f64(), r.as_f64()))),
    }
}

fn compare(op: BinaryOperator, left: &Value, right: &Value) -> Result<Ordering> {
    if let (Some(l), Some(r)) = (Number::of(left), Number::of(right)) {
        return l
            .as_f64()
            .partial_cmp(&r.as_f64())
            .ok_or_else(|| anyhow!("Cannot compare NaN with {}", op.symbol()));
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => Err(anyhow!(
            "Invalid operands for {}: {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            left.as_number() == right.as_number()
        }
        _ => left == right,
    }
}

fn evaluate_unary_op(op: UnaryOperator, operand: Value) -> Result<Value> {
    match op {
        UnaryOperator::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnaryOperator::Negate => match Number::of(&operand) {
            Some(Number::Int(i)) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(i as f64)))),
            Some(Number::Float(f)) => Ok(Value::Float(-f)),
            None => Err(anyhow!("Cannot negate {} value", operand.type_name())),
        },
    }
}
