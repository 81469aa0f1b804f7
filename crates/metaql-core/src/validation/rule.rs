//! Validation rule definitions.

use std::collections::BTreeMap;
use std::fmt;

use metaql_proto::{Filter, FilterOperator};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::catalog::FieldFormat;

/// Write operation a rule or hook applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a failing rule is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks the write.
    #[default]
    Error,
    Warning,
    Info,
}

/// One entry of a state machine transition table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTransition {
    #[serde(alias = "allowedNext")]
    pub allowed_next: Vec<String>,
    /// No transition out of a terminal state is ever allowed.
    #[serde(alias = "isTerminal")]
    pub is_terminal: bool,
}

impl StateTransition {
    pub fn to<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_next: states.into_iter().map(Into::into).collect(),
            is_terminal: false,
        }
    }

    pub fn terminal() -> Self {
        Self {
            allowed_next: Vec::new(),
            is_terminal: true,
        }
    }
}

/// Rule body, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Checks on a single field's value.
    Field {
        field: String,
        #[serde(default)]
        required: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "minLength")]
        min_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "maxLength")]
        max_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<FieldFormat>,
        /// Allowed values.
        #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "options")]
        one_of: Vec<Json>,
        /// Comparison against a literal.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<FilterOperator>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Json>,
    },
    /// Compare a field with another field of the merged record, or a literal.
    CrossField {
        field: String,
        operator: FilterOperator,
        #[serde(default, skip_serializing_if = "Option::is_none", alias = "compareTo")]
        compare_to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Json>,
    },
    /// Allowed value transitions of a status-like field.
    StateMachine {
        field: String,
        transitions: BTreeMap<String, StateTransition>,
    },
    /// Combination of fields must be unique across records.
    Unique { fields: Vec<String> },
    /// Boolean formula that must hold.
    BusinessRule {
        #[serde(alias = "expression", alias = "formula")]
        condition: String,
    },
    /// Delegated to a registered validator.
    Custom {
        validator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Json>,
    },
    /// When `field` has a value, every `requires` field must too.
    Dependency { field: String, requires: Vec<String> },
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Field { .. } => "field",
            RuleKind::CrossField { .. } => "cross_field",
            RuleKind::StateMachine { .. } => "state_machine",
            RuleKind::Unique { .. } => "unique",
            RuleKind::BusinessRule { .. } => "business_rule",
            RuleKind::Custom { .. } => "custom",
            RuleKind::Dependency { .. } => "dependency",
        }
    }

    /// Field the rule is reported against, if any.
    pub fn primary_field(&self) -> Option<&str> {
        match self {
            RuleKind::Field { field, .. }
            | RuleKind::CrossField { field, .. }
            | RuleKind::StateMachine { field, .. }
            | RuleKind::Dependency { field, .. } => Some(field),
            RuleKind::Unique { fields } => fields.first().map(String::as_str),
            RuleKind::BusinessRule { .. } | RuleKind::Custom { .. } => None,
        }
    }
}

/// A validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Message reported on failure; a generated one is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Stable code for API clients.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "errorCode")]
    pub error_code: Option<String>,
    /// Operations the rule runs on; create and update when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger: Vec<Operation>,
    #[serde(default)]
    pub severity: Severity,
    /// Guard evaluated against the merged record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Filter>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ValidationRule {
    pub fn new(name: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            message: None,
            error_code: None,
            trigger: Vec::new(),
            severity: Severity::Error,
            when: None,
            active: true,
        }
    }

    /// `field <operator> compare_to` over the merged record.
    pub fn cross_field(
        name: impl Into<String>,
        field: impl Into<String>,
        operator: FilterOperator,
        compare_to: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            RuleKind::CrossField {
                field: field.into(),
                operator,
                compare_to: Some(compare_to.into()),
                value: None,
            },
        )
    }

    pub fn state_machine(
        name: impl Into<String>,
        field: impl Into<String>,
        transitions: BTreeMap<String, StateTransition>,
    ) -> Self {
        Self::new(
            name,
            RuleKind::StateMachine {
                field: field.into(),
                transitions,
            },
        )
    }

    pub fn business_rule(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self::new(
            name,
            RuleKind::BusinessRule {
                condition: condition.into(),
            },
        )
    }

    pub fn unique<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            RuleKind::Unique {
                fields: fields.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn required(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(
            name,
            RuleKind::Field {
                field: field.into(),
                required: true,
                min: None,
                max: None,
                min_length: None,
                max_length: None,
                pattern: None,
                format: None,
                one_of: Vec::new(),
                operator: None,
                value: None,
            },
        )
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_trigger(mut self, operations: &[Operation]) -> Self {
        self.trigger = operations.to_vec();
        self
    }

    pub fn with_when(mut self, when: Filter) -> Self {
        self.when = Some(when);
        self
    }

    /// Whether the rule runs for this operation.
    pub fn applies_to(&self, operation: Operation) -> bool {
        if self.trigger.is_empty() {
            operation != Operation::Delete
        } else {
            self.trigger.contains(&operation)
        }
    }
}
