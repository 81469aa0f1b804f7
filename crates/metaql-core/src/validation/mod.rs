//! Validation rules and their evaluation.
//!
//! Rules come from three places: the `rules` of an object definition,
//! standalone `validation` metadata entries, and constraints declared on
//! field definitions (see [`field_rules`]).

mod rule;
mod validator;

pub use rule::{Operation, RuleKind, Severity, StateTransition, ValidationRule};
pub use validator::{
    field_rules, CustomValidator, UniquenessProbe, ValidationContext, ValidationEngine,
    ValidationIssue, ValidationResult,
};
