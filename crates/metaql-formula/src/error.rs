//! Formula error types.

use crate::span::{offset_to_column, Span};
use thiserror::Error;

/// Error during lexing/parsing.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ParseError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Optional hint for fixing the error.
    pub hint: Option<String>,
}

impl ParseError {
    /// Create a new parse error.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            hint: None,
        }
    }

    /// Add a hint to the error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Format the error with a caret under the offending source.
    pub fn format_with_source(&self, source: &str) -> String {
        let col = offset_to_column(source, self.span.start);
        let mut result = format!("error: {}\n  --> column {}\n   | {}\n   | ", self.message, col, source);
        for _ in 1..col {
            result.push(' ');
        }
        result.push('^');
        for _ in 1..self.span.len().max(1) {
            result.push('~');
        }
        result.push('\n');
        if let Some(hint) = &self.hint {
            result.push_str(&format!("   = hint: {}\n", hint));
        }
        result
    }
}

/// Stable classification of formula failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormulaErrorKind {
    /// Syntax error.
    Parse,
    /// Expression tried to reach outside the sandbox.
    BlockedOperation,
    /// Call to a function that is neither builtin nor registered.
    UnknownFunction,
    /// Reference to an unknown `$` system variable.
    UnknownVariable,
    /// Wrong number of arguments.
    Arity,
    /// Operand of the wrong type for a function.
    Type,
    /// Result could not be converted to the target type.
    Coercion,
    /// A registered custom function failed.
    Function,
}

/// Formula evaluation and analysis errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    /// Syntax error.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The expression attempted an operation capable of affecting the host.
    #[error("blocked operation: {operation}")]
    BlockedOperation {
        /// What was attempted.
        operation: String,
        /// Where.
        span: Span,
    },

    /// Unknown function.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Unknown system variable.
    #[error("unknown system variable '${0}'")]
    UnknownVariable(String),

    /// Wrong argument count.
    #[error("function '{function}' expects {expected} argument(s), got {got}")]
    Arity {
        /// Function name.
        function: String,
        /// Human-readable expectation, e.g. `1..=2`.
        expected: String,
        /// Actual count.
        got: usize,
    },

    /// Operand type error.
    #[error("type error: {0}")]
    Type(String),

    /// Target-type coercion failed.
    #[error("cannot convert {value} to {target}")]
    Coercion {
        /// Rendered offending value.
        value: String,
        /// Target type name.
        target: String,
    },

    /// Custom function failure.
    #[error("function '{function}' failed: {message}")]
    Function {
        /// Function name.
        function: String,
        /// Message returned by the function.
        message: String,
    },
}

impl FormulaError {
    /// Create a blocked-operation error.
    pub fn blocked(operation: impl Into<String>, span: Span) -> Self {
        FormulaError::BlockedOperation {
            operation: operation.into(),
            span,
        }
    }

    /// Stable kind for programmatic handling.
    pub fn kind(&self) -> FormulaErrorKind {
        match self {
            FormulaError::Parse(_) => FormulaErrorKind::Parse,
            FormulaError::BlockedOperation { .. } => FormulaErrorKind::BlockedOperation,
            FormulaError::UnknownFunction(_) => FormulaErrorKind::UnknownFunction,
            FormulaError::UnknownVariable(_) => FormulaErrorKind::UnknownVariable,
            FormulaError::Arity { .. } => FormulaErrorKind::Arity,
            FormulaError::Type(_) => FormulaErrorKind::Type,
            FormulaError::Coercion { .. } => FormulaErrorKind::Coercion,
            FormulaError::Function { .. } => FormulaErrorKind::Function,
        }
    }

    /// Whether the expression was rejected by the sandbox.
    pub fn is_blocked(&self) -> bool {
        matches!(self, FormulaError::BlockedOperation { .. })
    }
}
