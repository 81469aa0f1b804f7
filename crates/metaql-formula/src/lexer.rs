//! Lexer for formula expressions using logos.

use crate::error::ParseError;
use crate::span::Span;
use logos::Logos;

/// Token types for the formula language.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    // Arithmetic
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    // Comparison
    #[token("==")]
    Eq,
    #[token("===")]
    StrictEq,
    #[token("!=")]
    Ne,
    #[token("!==")]
    StrictNe,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,

    // Logical
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("!")]
    Bang,
    #[token("??")]
    Coalesce,

    // Ternary
    #[token("?")]
    Question,
    #[token(":")]
    Colon,

    // Rejected by the parser; lexed so errors point at them precisely.
    #[token("=")]
    Assign,
    #[token("=>")]
    Arrow,
    #[token(";")]
    Semicolon,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,

    // Literals
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    Text(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    /// `$name` system variable; the payload excludes the `$`.
    #[regex(r"\$[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice()[1..].to_string())]
    Variable(String),

    // Punctuation
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
}

impl Token {
    /// Short description used in parse errors.
    pub fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", n),
            Token::Text(s) => format!("string \"{}\"", s),
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Variable(name) => format!("variable '${}'", name),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Eq => "==",
            Token::StrictEq => "===",
            Token::Ne => "!=",
            Token::StrictNe => "!==",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::And => "&&",
            Token::Or => "||",
            Token::Bang => "!",
            Token::Coalesce => "??",
            Token::Question => "?",
            Token::Colon => ":",
            Token::Assign => "=",
            Token::Arrow => "=>",
            Token::Semicolon => ";",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::Dot => ".",
            Token::Comma => ",",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Number(_) | Token::Text(_) | Token::Ident(_) | Token::Variable(_) => "",
        }
    }
}

fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }

    result
}

/// A token with its span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenize a formula.
///
/// Unlike a permissive lexer, any character outside the grammar is an
/// error: formulas are untrusted input.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, ParseError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span: Span = lexer.span().into();
        match result {
            Ok(token) => tokens.push(SpannedToken { token, span }),
            Err(()) => {
                let text = lexer.slice();
                let hint = if text.starts_with('"') || text.starts_with('\'') {
                    "string literal is not terminated"
                } else {
                    "formulas may only contain literals, fields, operators and function calls"
                };
                return Err(ParseError::new(format!("unexpected character '{}'", text), span).with_hint(hint));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            kinds("quantity * unit_price + 1.5"),
            vec![
                Token::Ident("quantity".into()),
                Token::Star,
                Token::Ident("unit_price".into()),
                Token::Plus,
                Token::Number(1.5),
            ]
        );
    }

    #[test]
    fn test_longest_match_operators() {
        assert_eq!(
            kinds("a === b !== c ?? d"),
            vec![
                Token::Ident("a".into()),
                Token::StrictEq,
                Token::Ident("b".into()),
                Token::StrictNe,
                Token::Ident("c".into()),
                Token::Coalesce,
                Token::Ident("d".into()),
            ]
        );
        assert_eq!(kinds("x => y")[1], Token::Arrow);
        assert_eq!(kinds("x = y")[1], Token::Assign);
    }

    #[test]
    fn test_strings_and_variables() {
        assert_eq!(
            kinds(r#"'it\'s' + "a\tb" + $current_user.name"#),
            vec![
                Token::Text("it's".into()),
                Token::Plus,
                Token::Text("a\tb".into()),
                Token::Plus,
                Token::Variable("current_user".into()),
                Token::Dot,
                Token::Ident("name".into()),
            ]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(kinds("true false null"), vec![Token::True, Token::False, Token::Null]);
        assert_eq!(kinds("nullable"), vec![Token::Ident("nullable".into())]);
    }

    #[test]
    fn test_unknown_character_is_error() {
        let err = tokenize("a # b").unwrap_err();
        assert_eq!(err.span, Span::new(2, 3));

        let err = tokenize("`template`").unwrap_err();
        assert!(err.message.contains('`'));
    }

    #[test]
    fn test_exponent_numbers() {
        assert_eq!(kinds("1e3"), vec![Token::Number(1000.0)]);
    }
}
