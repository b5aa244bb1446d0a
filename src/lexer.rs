//! Lexer module - tokenizes formula text before parsing
//!
//! Formulas go through a two-phase front end:
//! 1. Lexer: formula text → token stream (pest grammar in `formula.pest`)
//! 2. Parser: token stream → AST
//!
//! This separation allows proper keyword/identifier distinction
//! (`notify` is an identifier, `not` is a keyword).

use crate::error::{syntax_error, PestError};
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "formula.pest"]
pub struct FormulaLexer;

/// A token with its value and position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Span of source text (byte offsets)
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    And,
    Or,
    Not,
    If,
    Else,
    True,
    False,
    None,

    // Literals
    Identifier(String),
    Integer(i64),
    Float(f64),
    String(String),

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    StarStar,     // **
    Slash,        // /
    SlashSlash,   // //
    Percent,      // %
    EqualEqual,   // ==
    NotEqual,     // !=
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=

    // Punctuation
    LeftParen,  // (
    RightParen, // )
    Comma,      // ,
    Dot,        // .

    Eof,
}

/// Lexer that converts formula text to tokens
pub struct Lexer<'a> {
    source: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
        }
    }

    /// Tokenize the formula
    pub fn tokenize(&mut self) -> Result<Vec<Token>, Box<PestError>> {
        let pairs = FormulaLexer::parse(Rule::tokens, self.source)?;

        for pair in pairs {
            if pair.as_rule() == Rule::tokens {
                for inner in pair.into_inner() {
                    if inner.as_rule() == Rule::token {
                        if let Some(token) = self.process_token(inner)? {
                            self.tokens.push(token);
                        }
                    }
                }
            }
        }

        let end = self.source.len();
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span {
                start: end,
                end,
                text: String::new(),
            },
        });

        Ok(std::mem::take(&mut self.tokens))
    }

    /// Process a single token pair
    fn process_token(
        &self,
        pair: pest::iterators::Pair<Rule>,
    ) -> Result<Option<Token>, Box<PestError>> {
        let span = Self::span_from_pair(&pair);

        for inner in pair.into_inner() {
            let kind = match inner.as_rule() {
                Rule::keyword_token => match inner.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "if" => TokenKind::If,
                    "else" => TokenKind::Else,
                    "True" | "true" => TokenKind::True,
                    "False" | "false" => TokenKind::False,
                    "None" | "null" => TokenKind::None,
                    kw => {
                        return Err(self.error_at(span.start, format!("Unknown keyword: {}", kw)))
                    }
                },

                Rule::identifier_token => TokenKind::Identifier(inner.as_str().to_string()),

                Rule::number_token => {
                    let text = inner.as_str();
                    if text.contains(['.', 'e', 'E']) {
                        let f: f64 = text.parse().map_err(|_| {
                            self.error_at(span.start, format!("Invalid float: {}", text))
                        })?;
                        TokenKind::Float(f)
                    } else {
                        match text.parse::<i64>() {
                            Ok(i) => TokenKind::Integer(i),
                            // Out of i64 range: keep the magnitude as a float
                            Err(_) => TokenKind::Float(text.parse().map_err(|_| {
                                self.error_at(span.start, format!("Invalid integer: {}", text))
                            })?),
                        }
                    }
                }

                Rule::string_token => self.process_string_token(inner)?,

                Rule::operator_token => match inner.as_str() {
                    "**" => TokenKind::StarStar,
                    "//" => TokenKind::SlashSlash,
                    "==" => TokenKind::EqualEqual,
                    "!=" => TokenKind::NotEqual,
                    "<=" => TokenKind::LessEqual,
                    ">=" => TokenKind::GreaterEqual,
                    "+" => TokenKind::Plus,
                    "-" => TokenKind::Minus,
                    "*" => TokenKind::Star,
                    "/" => TokenKind::Slash,
                    "%" => TokenKind::Percent,
                    "<" => TokenKind::Less,
                    ">" => TokenKind::Greater,
                    op => {
                        return Err(self.error_at(span.start, format!("Unknown operator: {}", op)))
                    }
                },

                Rule::punctuation_token => match inner.as_str() {
                    "(" => TokenKind::LeftParen,
                    ")" => TokenKind::RightParen,
                    "," => TokenKind::Comma,
                    "." => TokenKind::Dot,
                    p => {
                        return Err(
                            self.error_at(span.start, format!("Unknown punctuation: {}", p))
                        )
                    }
                },

                _ => continue,
            };

            return Ok(Some(Token { kind, span }));
        }

        Ok(None)
    }

    /// Process a quoted string token
    fn process_string_token(
        &self,
        pair: pest::iterators::Pair<Rule>,
    ) -> Result<TokenKind, Box<PestError>> {
        let start = pair.as_span().start();
        for quoted in pair.into_inner() {
            for content in quoted.into_inner() {
                if matches!(
                    content.as_rule(),
                    Rule::double_content | Rule::single_content
                ) {
                    return Ok(TokenKind::String(unescape_string(content.as_str())));
                }
            }
        }

        Err(self.error_at(start, "Invalid string token"))
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> Box<PestError> {
        Box::new(syntax_error(self.source, offset, message))
    }

    /// Create a Span from a pest Pair
    fn span_from_pair(pair: &pest::iterators::Pair<Rule>) -> Span {
        let pest_span = pair.as_span();
        Span {
            start: pest_span.start(),
            end: pest_span.end(),
            text: pair.as_str().to_string(),
        }
    }
}

/// Unescape a string (handle \n, \t, quotes and backslashes)
fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some('\\') => result.push('\\'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Convenience function to tokenize a formula
pub fn tokenize(source: &str) -> Result<Vec<Token>, Box<PestError>> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_keywords() {
        let tokens = tokenize("a if b else c").unwrap();
        assert_eq!(tokens.len(), 6); // 3 identifiers + 2 keywords + EOF
        assert!(matches!(tokens[1].kind, TokenKind::If));
        assert!(matches!(tokens[3].kind, TokenKind::Else));
    }

    #[test]
    fn test_keyword_vs_identifier() {
        // "not" is a keyword, "notify" and "android" are identifiers
        let tokens = tokenize("not notify android").unwrap();
        assert_eq!(tokens.len(), 4);
        assert!(matches!(tokens[0].kind, TokenKind::Not));
        assert!(matches!(&tokens[1].kind, TokenKind::Identifier(s) if s == "notify"));
        assert!(matches!(&tokens[2].kind, TokenKind::Identifier(s) if s == "android"));
    }

    #[test]
    fn test_tokenize_entity_reference() {
        let tokens = tokenize("sensor.kitchen_temp * 2").unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::Identifier(s) if s == "sensor"));
        assert!(matches!(tokens[1].kind, TokenKind::Dot));
        assert!(matches!(&tokens[2].kind, TokenKind::Identifier(s) if s == "kitchen_temp"));
        assert!(matches!(tokens[3].kind, TokenKind::Star));
        assert!(matches!(tokens[4].kind, TokenKind::Integer(2)));
    }

    #[test]
    fn test_tokenize_numbers() {
        let tokens = tokenize("42 3.5 1e3").unwrap();
        assert!(matches!(tokens[0].kind, TokenKind::Integer(42)));
        assert!(matches!(tokens[1].kind, TokenKind::Float(f) if f == 3.5));
        assert!(matches!(tokens[2].kind, TokenKind::Float(f) if f == 1000.0));
    }

    #[test]
    fn test_tokenize_strings() {
        let tokens = tokenize(r#""on" 'off' "say \"hi\"""#).unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::String(s) if s == "on"));
        assert!(matches!(&tokens[1].kind, TokenKind::String(s) if s == "off"));
        assert!(matches!(&tokens[2].kind, TokenKind::String(s) if s == "say \"hi\""));
    }

    #[test]
    fn test_tokenize_operators() {
        let tokens = tokenize("+ - * ** / // % == != <= >= < >").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::StarStar,
                TokenKind::Slash,
                TokenKind::SlashSlash,
                TokenKind::Percent,
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::Greater,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_span_tracking() {
        let tokens = tokenize("ab + cd").unwrap();
        assert_eq!(tokens[0].span.start, 0);
        assert_eq!(tokens[2].span.start, 5);
        assert_eq!(tokens[2].span.end, 7);
    }

    #[test]
    fn test_invalid_character_is_rejected() {
        assert!(tokenize("a = b").is_err());
        assert!(tokenize("a $ b").is_err());
    }
}
