//! Error handling and formatting
//!
//! `EngineError` is the typed taxonomy surfaced by the engine. Syntax errors
//! from the tokenizer and parser are pest errors so they carry a position and
//! can be rendered with context for humans.

use colored::Colorize;
use pest::error::{Error as PestErrorBase, ErrorVariant, LineColLocation};
use std::panic::Location;
use thiserror::Error;

use crate::lexer::Rule;

/// Positioned syntax error produced by the lexer and parser
pub type PestError = PestErrorBase<Rule>;

/// Errors raised by the formula engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed formula text
    #[error("parse error in formula '{formula}' at {line}:{column}: {message}")]
    Parse {
        formula: String,
        message: String,
        line: usize,
        column: usize,
    },

    /// Dependencies that are neither bound in the context nor known externally
    #[error("formula '{subject}' has missing dependencies: {}", .names.join(", "))]
    MissingDependency { subject: String, names: Vec<String> },

    /// Dependencies that are known but currently have no value
    #[error("formula '{subject}' has unavailable dependencies: {}", .names.join(", "))]
    UnavailableDependency { subject: String, names: Vec<String> },

    /// A dependency cycle; `path` ends with the node that closes the cycle
    #[error("circular dependency: {}", .path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// Write-discipline violation or integrity counter regression
    #[error("context integrity violation: {message}")]
    ContextIntegrity { message: String },

    /// A second context was requested for a subject that already owns one
    #[error("an evaluation context already exists for '{subject}'")]
    DuplicateContext { subject: String },

    #[error("subject '{subject}' is already registered")]
    DuplicateSubject { subject: String },

    #[error("unknown subject '{subject}'")]
    UnknownSubject { subject: String },

    /// Context lookup failure (missing key, not a null value)
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },

    /// Failure reported by the expression evaluator
    #[error("evaluation of '{subject}' failed: {message}")]
    Evaluation { subject: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Build a parse error from a positioned pest error
    pub fn from_syntax(formula: &str, error: &PestError) -> Self {
        let (line, column) = match error.line_col {
            LineColLocation::Pos((line, col)) => (line, col),
            LineColLocation::Span((line, col), _) => (line, col),
        };
        EngineError::Parse {
            formula: formula.to_string(),
            message: error.variant.message().to_string(),
            line,
            column,
        }
    }

    /// Raw scalar stored under a user-visible key
    pub(crate) fn raw_value_write(key: &str, type_name: &str, caller: &Location<'_>) -> Self {
        EngineError::ContextIntegrity {
            message: format!(
                "key '{}' received a raw {} value at {}:{}; user-visible keys require a ReferenceValue",
                key,
                type_name,
                caller.file(),
                caller.line()
            ),
        }
    }

    /// Diagnostic for humans. Parse errors show the formula with a caret
    /// under the failing column and a hint for common mistakes.
    pub fn render(&self) -> String {
        match self {
            EngineError::Parse {
                formula,
                message,
                line,
                column,
            } => {
                let error = match crate::token_parser::parse(formula) {
                    Err(error) => *error,
                    Ok(_) => {
                        let offset = byte_offset(formula, *line, *column);
                        syntax_error(formula, offset, message.as_str())
                    }
                };
                format_parse_error(&error, formula)
            }
            other => format!("{} {}\n", "Error:".red().bold(), other),
        }
    }

    /// Whether this error is fatal for the whole evaluation cycle
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CircularDependency { .. } | EngineError::ContextIntegrity { .. }
        )
    }
}

/// Create a custom syntax error positioned at a byte offset of `source`
pub fn syntax_error(source: &str, offset: usize, message: impl Into<String>) -> PestError {
    let position = pest::Position::new(source, offset.min(source.len()))
        .unwrap_or_else(|| pest::Position::from_start(source));
    PestErrorBase::new_from_pos(
        ErrorVariant::CustomError {
            message: message.into(),
        },
        position,
    )
}

fn byte_offset(source: &str, line: usize, column: usize) -> usize {
    let line_start: usize = source
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    source[line_start..]
        .char_indices()
        .nth(column.saturating_sub(1))
        .map_or(source.len(), |(i, _)| line_start + i)
}

/// Format a syntax error with the formula and a caret under the failing column
pub fn format_parse_error(error: &PestError, input: &str) -> String {
    let mut output = String::new();

    let col = match error.line_col {
        LineColLocation::Pos((_, col)) => col,
        LineColLocation::Span((_, col), _) => col,
    };

    output.push_str(&format!(
        "{} {}\n",
        "Parse error:".red().bold(),
        error.variant.message()
    ));

    output.push_str(&format!("   {}\n", "|".blue()));
    output.push_str(&format!("   {} {}\n", "|".blue(), input));
    let indicator = format!("{}^", " ".repeat(col.saturating_sub(1)));
    output.push_str(&format!("   {} {}\n", "|".blue(), indicator.red().bold()));

    if let ErrorVariant::ParsingError { positives, .. } = &error.variant {
        if !positives.is_empty() {
            output.push_str(&format!("  {} ", "Expected:".green().bold()));
            let expected: Vec<String> = positives.iter().map(format_rule_name).collect();
            output.push_str(&expected.join(", "));
            output.push('\n');
        }
    }

    output.push_str(&get_error_hint(input));

    output
}

/// Format a rule name to be more user-friendly
fn format_rule_name(rule: &Rule) -> String {
    match rule {
        Rule::EOI => "end of formula".to_string(),
        Rule::token => "token".to_string(),
        Rule::identifier_token => "identifier".to_string(),
        Rule::number_token => "number".to_string(),
        Rule::string_token => "string".to_string(),
        Rule::operator_token => "operator".to_string(),
        Rule::keyword_token => "keyword".to_string(),
        _ => format!("{:?}", rule).to_lowercase(),
    }
}

/// Get a helpful hint for common formula mistakes
fn get_error_hint(input: &str) -> String {
    let line = input.trim();

    if line.matches('(').count() != line.matches(')').count() {
        return format!("\n  {} Unbalanced parentheses\n", "Hint:".yellow().bold());
    }

    if line.contains('=') && !line.contains("==") && !line.contains("!=") {
        return format!(
            "\n  {} Use '==' for equality comparison, not '='\n",
            "Hint:".yellow().bold()
        );
    }

    if line.contains("&&") || line.contains("||") {
        return format!(
            "\n  {} Use 'and' / 'or' for boolean logic\n",
            "Hint:".yellow().bold()
        );
    }

    String::new()
}
