//! Token-based parser for formulas
//!
//! This module implements a recursive descent parser that consumes
//! tokens from the lexer to build an expression tree. Precedence, lowest first:
//! conditional (`a if c else b`), `or`, `and`, `not`, comparison, additive,
//! multiplicative, unary sign, `**`, postfix (call / member access).

use crate::ast::{BinaryOperator, Expression, SourceSpan, UnaryOperator, Value};
use crate::error::{syntax_error, PestError};
use crate::lexer::{Token, TokenKind};

type ParseResult<T> = Result<T, Box<PestError>>;

/// Parser that consumes tokens to produce an expression
pub struct TokenParser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    position: usize,
}

impl<'a> TokenParser<'a> {
    /// Create a new parser from a token stream. `source` is only used to
    /// position error messages.
    pub fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            position: 0,
        }
    }

    /// Parse a complete formula (exactly one expression)
    pub fn parse_formula(&mut self) -> ParseResult<Expression> {
        if self.is_at_end() {
            return Err(self.error_here("Empty formula"));
        }

        let expr = self.parse_expression()?;

        if !self.is_at_end() {
            return Err(self.error_here(format!(
                "Unexpected token after expression: {:?}",
                self.current().kind
            )));
        }

        Ok(expr)
    }

    fn parse_expression(&mut self) -> ParseResult<Expression> {
        self.parse_conditional()
    }

    /// Parse conditional expression: expr if expr else expr
    fn parse_conditional(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let expr = self.parse_or()?;

        if self.check(&TokenKind::If) {
            self.advance();
            let condition = self.parse_or()?;
            self.expect(&TokenKind::Else)?;
            let else_expr = self.parse_conditional()?;
            return Ok(Expression::Conditional {
                condition: Box::new(condition),
                then_expr: Box::new(expr),
                else_expr: Box::new(else_expr),
                span: self.span_from(start),
            });
        }

        Ok(expr)
    }

    /// Parse or expression
    fn parse_or(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let mut left = self.parse_and()?;

        while self.check(&TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Or,
                right: Box::new(right),
                span: self.span_from(start),
            };
        }

        Ok(left)
    }

    /// Parse and expression
    fn parse_and(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let mut left = self.parse_not()?;

        while self.check(&TokenKind::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::And,
                right: Box::new(right),
                span: self.span_from(start),
            };
        }

        Ok(left)
    }

    /// Parse `not` (binds looser than comparisons)
    fn parse_not(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();

        if self.check(&TokenKind::Not) {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expression::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(operand),
                span: self.span_from(start),
            });
        }

        self.parse_comparison()
    }

    /// Parse comparison and equality operators
    fn parse_comparison(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let mut left = self.parse_additive()?;

        loop {
            let op = match self.current().kind {
                TokenKind::EqualEqual => BinaryOperator::Equal,
                TokenKind::NotEqual => BinaryOperator::NotEqual,
                TokenKind::Less => BinaryOperator::LessThan,
                TokenKind::LessEqual => BinaryOperator::LessThanOrEqual,
                TokenKind::Greater => BinaryOperator::GreaterThan,
                TokenKind::GreaterEqual => BinaryOperator::GreaterThanOrEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span: self.span_from(start),
            };
        }

        Ok(left)
    }

    /// Parse addition/subtraction
    fn parse_additive(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span: self.span_from(start),
            };
        }

        Ok(left)
    }

    /// Parse multiplication/division/modulo
    fn parse_multiplicative(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOperator::Multiply,
                TokenKind::Slash => BinaryOperator::Divide,
                TokenKind::SlashSlash => BinaryOperator::FloorDivide,
                TokenKind::Percent => BinaryOperator::Modulo,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span: self.span_from(start),
            };
        }

        Ok(left)
    }

    /// Parse unary sign
    fn parse_unary(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();

        if self.check(&TokenKind::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::UnaryOp {
                op: UnaryOperator::Negate,
                operand: Box::new(operand),
                span: self.span_from(start),
            });
        }

        if self.check(&TokenKind::Plus) {
            self.advance();
            return self.parse_unary();
        }

        self.parse_power()
    }

    /// Parse power (right associative, binds tighter than unary on its left)
    fn parse_power(&mut self) -> ParseResult<Expression> {
        let start = self.mark_position();
        let base = self.parse_postfix()?;

        if self.check(&TokenKind::StarStar) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expression::BinaryOp {
                left: Box::new(base),
                op: BinaryOperator::Power,
                right: Box::new(exponent),
                span: self.span_from(start),
            });
        }

        Ok(base)
    }

    /// Parse postfix expressions (calls, member access)
    fn parse_postfix(&mut self) -> ParseResult<Expression> {
        let start_pos = self.mark_position();
        let mut expr = self.parse_primary()?;

        loop {
            if self.check(&TokenKind::LeftParen) && matches!(expr, Expression::Variable { .. }) {
                // Function call - only if expression is a plain name
                self.advance();
                let args = if !self.check(&TokenKind::RightParen) {
                    self.parse_argument_list()?
                } else {
                    Vec::new()
                };
                self.expect(&TokenKind::RightParen)?;

                if let Expression::Variable { name, .. } = expr {
                    expr = Expression::FunctionCall {
                        name,
                        args,
                        span: self.span_from(start_pos),
                    };
                }
            } else if self.check(&TokenKind::Dot) {
                self.advance();
                let field = self.parse_member_name()?;
                expr = Expression::MemberAccess {
                    object: Box::new(expr),
                    field,
                    span: self.span_from(start_pos),
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Parse argument list
    fn parse_argument_list(&mut self) -> ParseResult<Vec<Expression>> {
        let mut args = vec![self.parse_expression()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            args.push(self.parse_expression()?);
        }
        Ok(args)
    }

    /// Parse primary expression
    fn parse_primary(&mut self) -> ParseResult<Expression> {
        if self.check(&TokenKind::LeftParen) {
            self.advance();
            let expr = self.parse_expression()?;
            self.expect(&TokenKind::RightParen)?;
            return Ok(expr);
        }

        let literal_span = self.current_span();
        if let Some(value) = self.parse_literal() {
            return Ok(Expression::Literal {
                value,
                span: literal_span,
            });
        }

        if self.check_identifier() {
            let span = self.current_span();
            let name = self.parse_identifier()?;
            return Ok(Expression::Variable { name, span });
        }

        if self.is_at_end() {
            return Err(self.error_here("Unexpected end of formula"));
        }

        Err(self.error_here(format!("Unexpected token: {:?}", self.current().kind)))
    }

    /// Try to parse a literal value
    fn parse_literal(&mut self) -> Option<Value> {
        let value = match &self.current().kind {
            TokenKind::Integer(i) => Value::Int(*i),
            TokenKind::Float(f) => Value::Float(*f),
            TokenKind::String(s) => Value::String(s.clone()),
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            TokenKind::None => Value::Null,
            _ => return None,
        };
        self.advance();
        Some(value)
    }

    /// Parse an identifier
    fn parse_identifier(&mut self) -> ParseResult<String> {
        match &self.current().kind {
            TokenKind::Identifier(name) => {
                let n = name.clone();
                self.advance();
                Ok(n)
            }
            other => {
                let message = format!("Expected identifier, got {:?}", other);
                Err(self.error_here(message))
            }
        }
    }

    /// Member names may also be integers (`sensor.1st_floor` lexes as a number
    /// followed by an identifier) or keywords used as attribute names.
    fn parse_member_name(&mut self) -> ParseResult<String> {
        let name = match &self.current().kind {
            TokenKind::Identifier(name) => name.clone(),
            TokenKind::Integer(_) => {
                let mut name = self.current().span.text.clone();
                // Glue an immediately following identifier: `1st_floor`
                let end = self.current().span.end;
                if let Some(next) = self.tokens.get(self.position + 1) {
                    if let TokenKind::Identifier(rest) = &next.kind {
                        if next.span.start == end {
                            name.push_str(rest);
                            self.advance();
                        }
                    }
                }
                name
            }
            _ => return self.parse_identifier(),
        };
        self.advance();
        Ok(name)
    }

    // Helper methods

    fn current(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current().kind, TokenKind::Eof)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.position += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn check_identifier(&self) -> bool {
        matches!(self.current().kind, TokenKind::Identifier(_))
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            let message = format!("Expected {:?}, got {:?}", kind, self.current().kind);
            Err(self.error_here(message))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> Box<PestError> {
        Box::new(syntax_error(self.source, self.current().span.start, message))
    }

    /// Mark the current position to start tracking a span
    fn mark_position(&self) -> usize {
        self.position
    }

    /// Create a SourceSpan from a marked position to the last consumed token
    fn span_from(&self, start_pos: usize) -> Option<SourceSpan> {
        let start_token = self.tokens.get(start_pos)?;
        let end_token = self.tokens.get(self.position.saturating_sub(1))?;

        Some(SourceSpan {
            offset: start_token.span.start,
            length: end_token.span.end.saturating_sub(start_token.span.start),
        })
    }

    /// Get the span of the current token
    fn current_span(&self) -> Option<SourceSpan> {
        let token = self.tokens.get(self.position)?;
        Some(SourceSpan {
            offset: token.span.start,
            length: token.span.text.len(),
        })
    }
}

/// Parse formula text into an expression
pub fn parse(source: &str) -> Result<Expression, Box<PestError>> {
    let tokens = crate::lexer::tokenize(source)?;
    let mut parser = TokenParser::new(source, tokens);
    parser.parse_formula()
}
