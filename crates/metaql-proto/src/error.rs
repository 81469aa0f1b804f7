//! IR error types.

use thiserror::Error;

/// Errors raised while reading query IR.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A filter leaf did not have exactly `[field, operator, value]`.
    #[error("malformed filter condition: {0}")]
    MalformedCondition(String),

    /// Operator string is not recognised.
    #[error("unknown filter operator '{0}'")]
    UnknownOperator(String),

    /// Two logic tokens were adjacent, or a group started/ended with one.
    #[error("misplaced logic token '{0}' in filter group")]
    MisplacedLogicToken(String),

    /// A filter node of an unsupported JSON type.
    #[error("invalid filter node: {0}")]
    InvalidFilter(String),

    /// Value does not fit the operator (e.g. `between` without a pair).
    #[error("invalid value for operator '{operator}': {message}")]
    InvalidOperand {
        /// Operator name.
        operator: String,
        /// Description of the problem.
        message: String,
    },
}
