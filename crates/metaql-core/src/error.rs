//! Core error types.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::validation::ValidationIssue;

/// Core engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Unregistered object or field referenced.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// One or more validation rules failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Formula could not be compiled or evaluated.
    #[error("formula error in '{field}': {source}")]
    Formula {
        field: String,
        #[source]
        source: metaql_formula::FormulaError,
    },

    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Transaction failed; rollback has already been attempted.
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Storage driver error.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A hook handler failed.
    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    /// Action lookup or execution failed.
    #[error("action error: {0}")]
    Action(String),

    /// Dependency graph is invalid.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Record not found.
    #[error("record not found: {object}/{id}")]
    NotFound { object: String, id: String },

    /// Malformed query or filter.
    #[error("query error: {0}")]
    Query(#[from] metaql_proto::Error),
}

/// Stable error classification for mapping to transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    Validation,
    Formula,
    PoolExhausted,
    Transaction,
    Driver,
    Hook,
    Action,
    Graph,
    Config,
    NotFound,
    Query,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Schema => "schema",
            ErrorKind::Validation => "validation",
            ErrorKind::Formula => "formula",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Driver => "driver",
            ErrorKind::Hook => "hook",
            ErrorKind::Action => "action",
            ErrorKind::Graph => "graph",
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Query => "query",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Schema(_) => ErrorKind::Schema,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Formula { .. } => ErrorKind::Formula,
            Error::Pool(PoolError::Exhausted { .. }) => ErrorKind::PoolExhausted,
            Error::Pool(_) => ErrorKind::Config,
            Error::Transaction { .. } => ErrorKind::Transaction,
            Error::Driver(DriverError::NotFound { .. }) => ErrorKind::NotFound,
            Error::Driver(_) => ErrorKind::Driver,
            Error::Hook(_) => ErrorKind::Hook,
            Error::Action(_) => ErrorKind::Action,
            Error::Graph(_) => ErrorKind::Graph,
            Error::Config(_) => ErrorKind::Config,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Query(_) => ErrorKind::Query,
        }
    }

    /// The validation failure, if this is one or a transaction failed
    /// because of one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self.root_cause() {
            Error::Validation(err) => Some(err),
            _ => None,
        }
    }

    /// The error a transaction rolled back for, or `self`.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Transaction {
                source: Some(source), ..
            } => source.root_cause(),
            other => other,
        }
    }

    pub(crate) fn formula(field: impl Into<String>, source: metaql_formula::FormulaError) -> Self {
        Error::Formula {
            field: field.into(),
            source,
        }
    }

    pub(crate) fn transaction(message: impl Into<String>, source: Option<Error>) -> Self {
        Error::Transaction {
            message: message.into(),
            source: source.map(Box::new),
        }
    }
}

/// Reference to metadata that does not exist or is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Object not registered.
    #[error("unknown object '{0}'")]
    UnknownObject(String),

    /// Field not defined on an object.
    #[error("unknown field '{field}' on object '{object}'")]
    UnknownField { object: String, field: String },

    /// Field used as a relationship is not a lookup or master_detail.
    #[error("field '{field}' on object '{object}' is not a reference")]
    NotAReference { object: String, field: String },

    /// No datasource registered under a name.
    #[error("unknown datasource '{0}'")]
    UnknownDatasource(String),

    /// Object definition content could not be parsed.
    #[error("invalid definition for '{id}': {message}")]
    InvalidDefinition { id: String, message: String },
}

/// Aggregated validation failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("validation failed for '{object}': {}", summary(.errors))]
pub struct ValidationError {
    pub object: String,
    /// Every failing rule of severity `error`.
    pub errors: Vec<ValidationIssue>,
    /// Warnings collected during the same run.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationError {
    /// Error codes of every failing rule, in evaluation order.
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.error_code.as_str()).collect()
    }

    /// Whether a rule with this code failed.
    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.error_code == code)
    }
}

fn summary(errors: &[ValidationIssue]) -> String {
    errors
        .iter()
        .map(|e| format!("[{}] {}", e.error_code, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Connection pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Bounded wait elapsed without a free slot.
    #[error("connection pool exhausted for '{driver}' after {waited:?}")]
    Exhausted { driver: String, waited: Duration },

    /// The handle was not issued by this pool or was already released.
    #[error("unknown connection handle {0}")]
    UnknownHandle(u64),

    /// A configured limit is zero.
    #[error("invalid pool limit for '{0}'")]
    InvalidLimit(String),

    /// The pool was dropped while a caller was waiting.
    #[error("connection pool closed")]
    Closed,
}

/// Dependency graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Ownership edges form a cycle.
    #[error("circular master_detail dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// Object not present in the graph.
    #[error("object '{0}' is not in the dependency graph")]
    UnknownObject(String),
}

/// Errors raised by storage drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver does not implement an optional capability.
    #[error("driver '{driver}' does not support {operation}")]
    Unsupported { driver: String, operation: String },

    /// Record not found by id.
    #[error("record '{id}' not found in '{object}'")]
    NotFound { object: String, id: String },

    /// A record with this id already exists.
    #[error("record '{id}' already exists in '{object}'")]
    Duplicate { object: String, id: String },

    /// Unknown or finished transaction handle.
    #[error("invalid transaction handle '{0}'")]
    InvalidTransaction(String),

    /// Backend storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Record (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Hook dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} hook on '{object}' failed: {message}")]
pub struct HookError {
    pub event: String,
    pub object: String,
    pub message: String,
}

impl HookError {
    pub fn new(event: impl Into<String>, object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            object: object.into(),
            message: message.into(),
        }
    }
}

/// Result alias for the core crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Severity;

    #[test]
    fn test_error_kinds() {
        let err: Error = SchemaError::UnknownObject("ghost".into()).into();
        assert_eq!(err.kind(), ErrorKind::Schema);

        let err: Error = PoolError::Exhausted {
            driver: "memory".into(),
            waited: Duration::from_millis(5),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);

        let err: Error = DriverError::NotFound {
            object: "task".into(),
            id: "1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(ErrorKind::PoolExhausted.to_string(), "pool_exhausted");
    }

    #[test]
    fn test_validation_error_summary() {
        let err = ValidationError {
            object: "project".into(),
            errors: vec![ValidationIssue {
                rule: "date_range".into(),
                field: Some("end_date".into()),
                message: "End date must be after start date".into(),
                error_code: "INVALID_DATE_RANGE".into(),
                severity: Severity::Error,
            }],
            warnings: vec![],
        };
        assert!(err.has_code("INVALID_DATE_RANGE"));
        assert_eq!(err.error_codes(), vec!["INVALID_DATE_RANGE"]);
        assert!(err.to_string().contains("[INVALID_DATE_RANGE]"));

        let wrapped: Error = err.into();
        assert_eq!(wrapped.kind(), ErrorKind::Validation);
        assert!(wrapped.as_validation().is_some());
    }
}
