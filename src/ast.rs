//! Abstract Syntax Tree definitions for formulas
//!
//! A formula is a single expression. The tree is produced once per distinct
//! formula text by the token parser and shared (behind `Arc`) between the
//! analyzer and the evaluator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source location information (byte offsets into the formula text)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub offset: usize,
    pub length: usize,
}

/// Expression (produces a value)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Literal value
    Literal {
        value: Value,
        span: Option<SourceSpan>,
    },

    /// Variable reference
    Variable {
        name: String,
        span: Option<SourceSpan>,
    },

    /// Member access: `sensor.kitchen` or `var.attribute`
    MemberAccess {
        object: Box<Expression>,
        field: String,
        span: Option<SourceSpan>,
    },

    /// Function call: `max(a, b)`
    FunctionCall {
        name: String,
        args: Vec<Expression>,
        span: Option<SourceSpan>,
    },

    /// Binary operation
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
        span: Option<SourceSpan>,
    },

    /// Unary operation
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expression>,
        span: Option<SourceSpan>,
    },

    /// Conditional expression: `then_expr if condition else else_expr`
    Conditional {
        condition: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
        span: Option<SourceSpan>,
    },
}

impl Expression {
    /// Span of this node, if the parser recorded one
    pub fn span(&self) -> Option<SourceSpan> {
        match self {
            Expression::Literal { span, .. }
            | Expression::Variable { span, .. }
            | Expression::MemberAccess { span, .. }
            | Expression::FunctionCall { span, .. }
            | Expression::BinaryOp { span, .. }
            | Expression::UnaryOp { span, .. }
            | Expression::Conditional { span, .. } => *span,
        }
    }

    /// Dotted path for chains of plain member accesses rooted at a variable.
    ///
    /// `sensor.kitchen_temp` yields `["sensor", "kitchen_temp"]`; anything that
    /// is not a pure `Variable(.field)*` chain yields `None`.
    pub fn dotted_path(&self) -> Option<Vec<&str>> {
        match self {
            Expression::Variable { name, .. } => Some(vec![name.as_str()]),
            Expression::MemberAccess { object, field, .. } => {
                let mut path = object.dotted_path()?;
                path.push(field.as_str());
                Some(path)
            }
            _ => None,
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
}

impl BinaryOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::FloorDivide => "//",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Power => "**",
            BinaryOperator::Equal => "==",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Negate,
}

/// Runtime scalar values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

impl Value {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value. Numeric strings are accepted because
    /// external states are usually reported as text.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Null => None,
        }
    }

    /// Integer view, only for values that are integral
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Null => "none",
        }
    }

    /// Convert to string representation
    pub fn to_string_repr(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "None".to_string(),
        }
    }

    /// Truthiness following the formula language rules
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Null => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other.to_string_repr()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal { value, .. } => write!(f, "{}", value),
            Expression::Variable { name, .. } => write!(f, "{}", name),
            Expression::MemberAccess { object, field, .. } => write!(f, "{}.{}", object, field),
            Expression::FunctionCall { name, args, .. } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expression::BinaryOp {
                op, left, right, ..
            } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expression::UnaryOp { op, operand, .. } => match op {
                UnaryOperator::Not => write!(f, "(not {})", operand),
                UnaryOperator::Negate => write!(f, "(-{})", operand),
            },
            Expression::Conditional {
                condition,
                then_expr,
                else_expr,
                ..
            } => write!(f, "({} if {} else {})", then_expr, condition, else_expr),
        }
    }
}
