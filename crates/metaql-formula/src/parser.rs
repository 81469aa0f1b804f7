//! Recursive descent parser for formula expressions.
//!
//! Precedence, lowest first: `?:`, `??`, `||`, `&&`, equality, comparison,
//! additive, multiplicative, unary, then literals, paths and calls.

use crate::ast::*;
use crate::error::{FormulaError, ParseError};
use crate::lexer::{tokenize, SpannedToken, Token};
use crate::span::Span;

/// Identifiers that may never appear in a formula, as a field, path segment
/// or function name.
pub const BLOCKED_IDENTIFIERS: &[&str] = &[
    "eval",
    "Function",
    "require",
    "import",
    "process",
    "globalThis",
    "global",
    "window",
    "document",
    "fetch",
    "XMLHttpRequest",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "constructor",
    "__proto__",
    "prototype",
    "new",
    "function",
    "return",
    "var",
    "let",
    "const",
    "delete",
    "this",
    "class",
    "async",
    "await",
    "yield",
];

/// Whether an identifier is on the blocklist.
pub fn is_blocked_identifier(name: &str) -> bool {
    BLOCKED_IDENTIFIERS.contains(&name)
}

/// Parse a formula into an expression tree.
pub fn parse(source: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(source)?;
    reject_blocked(&tokens)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source_len: source.len(),
    };
    let expr = parser.parse_expression()?;
    if let Some(tok) = parser.peek() {
        return Err(ParseError::new(
            format!("unexpected {} after expression", tok.token.describe()),
            tok.span,
        )
        .into());
    }
    Ok(expr)
}

/// Sandbox check over the raw token stream, so a blocked construct is
/// reported as such even where it would also be a syntax error.
fn reject_blocked(tokens: &[SpannedToken]) -> Result<(), FormulaError> {
    for tok in tokens {
        let operation = match &tok.token {
            Token::Ident(name) if is_blocked_identifier(name) => name.clone(),
            Token::Assign => "assignment".to_string(),
            Token::Arrow => "arrow function".to_string(),
            Token::Semicolon => "statement separator".to_string(),
            Token::LBracket => "computed member access".to_string(),
            _ => continue,
        };
        return Err(FormulaError::blocked(operation, tok.span));
    }
    Ok(())
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn peek_token(&self) -> Option<&Token> {
        self.peek().map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<SpannedToken> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eof_span(&self) -> Span {
        Span::new(self.source_len, self.source_len)
    }

    fn next_token(&mut self) -> Result<SpannedToken, ParseError> {
        let span = self.eof_span();
        self.advance()
            .ok_or_else(|| ParseError::new("unexpected end of formula", span))
    }

    fn expect(&mut self, expected: Token) -> Result<Span, ParseError> {
        let tok = self.next_token()?;
        if tok.token == expected {
            Ok(tok.span)
        } else {
            Err(ParseError::new(
                format!("expected {}, found {}", expected.describe(), tok.token.describe()),
                tok.span,
            ))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek_token() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new("empty formula", Span::new(0, 0)));
        }
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let condition = self.parse_coalesce()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then_branch = self.parse_conditional()?;
        self.expect(Token::Colon)?;
        let else_branch = self.parse_conditional()?;
        let span = condition.span.merge(else_branch.span);
        Ok(Expr::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        ))
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        self.parse_logical(LogicalOp::Coalesce)
    }

    /// `??` binds loosest, then `||`, then `&&`.
    fn parse_logical(&mut self, op: LogicalOp) -> Result<Expr, ParseError> {
        let (token, next) = match op {
            LogicalOp::Coalesce => (Token::Coalesce, Some(LogicalOp::Or)),
            LogicalOp::Or => (Token::Or, Some(LogicalOp::And)),
            LogicalOp::And => (Token::And, None),
        };
        let operand = |p: &mut Parser| match next {
            Some(next) => p.parse_logical(next),
            None => p.parse_equality(),
        };

        let mut left = operand(self)?;
        while self.eat(&token) {
            let right = operand(self)?;
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(0)
    }

    /// Binary levels from loosest to tightest.
    fn parse_binary_level(&mut self, level: usize) -> Result<Expr, ParseError> {
        const LEVELS: usize = 4;
        if level == LEVELS {
            return self.parse_unary();
        }

        let mut left = self.parse_binary_level(level + 1)?;
        while let Some(op) = self.peek_token().and_then(|t| binary_op_at(level, t)) {
            self.pos += 1;
            let right = self.parse_binary_level(level + 1)?;
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_token() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Bang) => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        let start = self.next_token()?.span;
        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let tok = self.next_token()?;
        let span = tok.span;
        match tok.token {
            Token::Number(n) => Ok(Expr::new(ExprKind::Number(n), span)),
            Token::Text(s) => Ok(Expr::new(ExprKind::Text(s), span)),
            Token::True => Ok(Expr::new(ExprKind::Bool(true), span)),
            Token::False => Ok(Expr::new(ExprKind::Bool(false), span)),
            Token::Null => Ok(Expr::new(ExprKind::Null, span)),
            Token::LParen => {
                let inner = self.parse_conditional()?;
                let end = self.expect(Token::RParen)?;
                Ok(Expr::new(inner.kind, span.merge(end)))
            }
            Token::Variable(name) => {
                let (path, end) = self.parse_member_path(span)?;
                Ok(Expr::new(ExprKind::System { name, path }, span.merge(end)))
            }
            Token::Ident(first) => {
                let (rest, end) = self.parse_member_path(span)?;
                let mut path = Vec::with_capacity(rest.len() + 1);
                path.push(first);
                path.extend(rest);

                if self.peek_token() == Some(&Token::LParen) {
                    self.parse_call(path, span.merge(end))
                } else {
                    Ok(Expr::new(ExprKind::Field(path), span.merge(end)))
                }
            }
            other => Err(ParseError::new(format!("unexpected {}", other.describe()), span)),
        }
    }

    fn parse_member_path(&mut self, start: Span) -> Result<(Vec<String>, Span), ParseError> {
        let mut path = Vec::new();
        let mut end = start;
        while self.eat(&Token::Dot) {
            let tok = self.next_token()?;
            match tok.token {
                Token::Ident(segment) => {
                    path.push(segment);
                    end = tok.span;
                }
                other => {
                    return Err(ParseError::new(
                        format!("expected field name after '.', found {}", other.describe()),
                        tok.span,
                    ))
                }
            }
        }
        Ok((path, end))
    }

    fn parse_call(&mut self, path: Vec<String>, callee_span: Span) -> Result<Expr, ParseError> {
        let function = match path.as_slice() {
            [name] => name.clone(),
            [namespace, name] if namespace == "Math" => name.clone(),
            _ => {
                return Err(ParseError::new(
                    format!("method calls are not supported: '{}'", path.join(".")),
                    callee_span,
                )
                .with_hint("call functions directly, e.g. upper(name)"))
            }
        };

        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_conditional()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen)?;
                break;
            }
        }
        let end = self.tokens[self.pos - 1].span;

        Ok(Expr::new(ExprKind::Call { function, args }, callee_span.merge(end)))
    }
}

fn binary_op_at(level: usize, token: &Token) -> Option<BinaryOp> {
    let op = match (level, token) {
        (0, Token::Eq) => BinaryOp::Eq,
        (0, Token::Ne) => BinaryOp::Ne,
        (0, Token::StrictEq) => BinaryOp::StrictEq,
        (0, Token::StrictNe) => BinaryOp::StrictNe,
        (1, Token::Lt) => BinaryOp::Lt,
        (1, Token::Le) => BinaryOp::Le,
        (1, Token::Gt) => BinaryOp::Gt,
        (1, Token::Ge) => BinaryOp::Ge,
        (2, Token::Plus) => BinaryOp::Add,
        (2, Token::Minus) => BinaryOp::Sub,
        (3, Token::Star) => BinaryOp::Mul,
        (3, Token::Slash) => BinaryOp::Div,
        (3, Token::Percent) => BinaryOp::Rem,
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormulaErrorKind;

    fn field(name: &str) -> ExprKind {
        ExprKind::Field(vec![name.to_string()])
    }

    #[test]
    fn test_multiplication_binds_tighter() {
        let expr = parse("a + b * c").unwrap();
        match expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Add,
                left,
                right,
            } => {
                assert_eq!(left.kind, field("a"));
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse("a || b && c").unwrap();
        match expr.kind {
            ExprKind::Logical {
                op: LogicalOp::Or,
                right,
                ..
            } => assert!(matches!(right.kind, ExprKind::Logical { op: LogicalOp::And, .. })),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ternary_is_right_associative() {
        let expr = parse("a ? 1 : b ? 2 : 3").unwrap();
        match expr.kind {
            ExprKind::Conditional { else_branch, .. } => {
                assert!(matches!(else_branch.kind, ExprKind::Conditional { .. }))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lookup_chain_and_system_variable() {
        let expr = parse("account.owner.name").unwrap();
        assert_eq!(
            expr.kind,
            ExprKind::Field(vec!["account".into(), "owner".into(), "name".into()])
        );

        let expr = parse("$current_user.email").unwrap();
        assert_eq!(
            expr.kind,
            ExprKind::System {
                name: "current_user".into(),
                path: vec!["email".into()]
            }
        );
    }

    #[test]
    fn test_calls_and_math_alias() {
        let expr = parse("Math.round(total, 2)").unwrap();
        match expr.kind {
            ExprKind::Call { function, args } => {
                assert_eq!(function, "round");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse("today()").unwrap().kind, ExprKind::Call { ref args, .. } if args.is_empty()));
    }

    #[test]
    fn test_method_calls_rejected() {
        let err = parse("name.toUpperCase()").unwrap_err();
        assert_eq!(err.kind(), FormulaErrorKind::Parse);
    }

    #[test]
    fn test_blocked_constructs() {
        for source in [
            "eval('1')",
            "process.exit()",
            "x.constructor",
            "a.__proto__.b",
            "new Date()",
            "x = 1",
            "a; b",
            "(x) => x",
            "a['constructor']",
            "require('fs')",
        ] {
            let err = parse(source).unwrap_err();
            assert!(err.is_blocked(), "{} should be blocked, got {:?}", source, err);
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse("").unwrap_err().kind(), FormulaErrorKind::Parse);
        assert_eq!(parse("a +").unwrap_err().kind(), FormulaErrorKind::Parse);
        assert_eq!(parse("(a + b").unwrap_err().kind(), FormulaErrorKind::Parse);
        assert_eq!(parse("a b").unwrap_err().kind(), FormulaErrorKind::Parse);
        assert_eq!(parse("f(a,)").unwrap_err().kind(), FormulaErrorKind::Parse);
    }

    #[test]
    fn test_spans_cover_expression() {
        let expr = parse("price * 2").unwrap();
        assert_eq!(expr.span, Span::new(0, 9));
    }
}
