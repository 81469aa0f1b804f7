//! Rule evaluation.
//!
//! The [`ValidationEngine`] runs a set of [`ValidationRule`]s against a
//! candidate record. Every error-severity rule is evaluated and collected
//! unless fail-fast is configured, so one request reports every violation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use metaql_formula::{FormulaContext, FormulaEngine};
use metaql_proto::{get_path, is_blank, merge_records, values_equal, Filter, FilterOperator, Record};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, trace};

use crate::catalog::{FieldFormat, ObjectDefinition};
use crate::config::ValidationConfig;
use crate::error::{Error, Result, SchemaError, ValidationError};
use crate::query::filter::{compare, matches};

use super::rule::{Operation, RuleKind, Severity, StateTransition, ValidationRule};

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";
const URL_PATTERN: &str = r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^\s/?#]+[^\s]*$";

/// One failed rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub rule: String,
    pub field: Option<String>,
    pub message: String,
    pub error_code: String,
    pub severity: Severity,
}

/// Outcome of a validation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    /// `true` when no error-severity rule failed.
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub infos: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Error => {
                self.valid = false;
                self.errors.push(issue);
            }
            Severity::Warning => self.warnings.push(issue),
            Severity::Info => self.infos.push(issue),
        }
    }

    /// Convert into a write decision: warnings on success, the aggregated
    /// error otherwise.
    pub fn into_result(self, object: &str) -> std::result::Result<Vec<ValidationIssue>, ValidationError> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(ValidationError {
                object: object.to_string(),
                errors: self.errors,
                warnings: self.warnings,
            })
        }
    }
}

/// Answers whether a combination of field values is already taken.
#[async_trait::async_trait]
pub trait UniquenessProbe: Send + Sync {
    /// Whether a record of `object` other than `exclude_id` matches `filter`.
    async fn exists(&self, object: &str, filter: &Filter, exclude_id: Option<&str>) -> Result<bool>;
}

/// A named validator for `custom` rules.
#[async_trait::async_trait]
pub trait CustomValidator: Send + Sync {
    /// Return `Ok(None)` when the record passes, or a failure message.
    async fn validate(&self, ctx: &ValidationContext<'_>, params: Option<&Json>) -> Result<Option<String>>;
}

/// What is being validated.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub object: &'a str,
    /// Incoming data; a partial record on update.
    pub record: &'a Record,
    /// Stored record before an update or delete.
    pub previous: Option<&'a Record>,
    pub operation: Operation,
    pub user: Option<&'a Record>,
    pub record_id: Option<&'a str>,
    pub uniqueness: Option<&'a dyn UniquenessProbe>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(object: &'a str, record: &'a Record, operation: Operation) -> Self {
        Self {
            object,
            record,
            previous: None,
            operation,
            user: None,
            record_id: None,
            uniqueness: None,
        }
    }

    pub fn with_previous(mut self, previous: &'a Record) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_user(mut self, user: &'a Record) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_record_id(mut self, id: &'a str) -> Self {
        self.record_id = Some(id);
        self
    }

    pub fn with_uniqueness(mut self, probe: &'a dyn UniquenessProbe) -> Self {
        self.uniqueness = Some(probe);
        self
    }

    /// Previous record overlaid with the incoming data.
    pub fn merged(&self) -> Cow<'a, Record> {
        match self.previous {
            Some(previous) => Cow::Owned(merge_records(previous, self.record)),
            None => Cow::Borrowed(self.record),
        }
    }
}

impl std::fmt::Debug for ValidationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationContext")
            .field("object", &self.object)
            .field("operation", &self.operation)
            .field("record_id", &self.record_id)
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}

/// A failed check before the rule's overrides are applied.
struct Failure {
    code: &'static str,
    message: String,
}

impl Failure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Evaluates validation rules.
pub struct ValidationEngine {
    formulas: Arc<FormulaEngine>,
    validators: RwLock<HashMap<String, Arc<dyn CustomValidator>>>,
    patterns: Mutex<HashMap<String, Regex>>,
    config: ValidationConfig,
}

impl ValidationEngine {
    pub fn new(formulas: Arc<FormulaEngine>, config: ValidationConfig) -> Self {
        Self {
            formulas,
            validators: RwLock::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register the validator used by `custom` rules naming it.
    pub fn register_validator(&self, name: impl Into<String>, validator: Arc<dyn CustomValidator>) {
        self.validators.write().insert(name.into(), validator);
    }

    pub fn unregister_validator(&self, name: &str) -> bool {
        self.validators.write().remove(name).is_some()
    }

    /// Run `rules` against the context.
    pub async fn validate(&self, rules: &[ValidationRule], ctx: &ValidationContext<'_>) -> Result<ValidationResult> {
        let merged = ctx.merged();
        let mut result = ValidationResult {
            valid: true,
            ..Default::default()
        };

        for rule in rules {
            if !rule.active || !rule.applies_to(ctx.operation) {
                continue;
            }
            if let Some(when) = &rule.when {
                if !matches(&merged, when) {
                    trace!(rule = %rule.name, "rule guard not satisfied");
                    continue;
                }
            }

            let Some(failure) = self.check(rule, ctx, &merged).await? else {
                continue;
            };

            let issue = ValidationIssue {
                rule: rule.name.clone(),
                field: rule.kind.primary_field().map(str::to_string),
                message: rule.message.clone().unwrap_or(failure.message),
                error_code: rule
                    .error_code
                    .clone()
                    .unwrap_or_else(|| failure.code.to_string()),
                severity: rule.severity,
            };
            debug!(
                object = ctx.object,
                rule = %issue.rule,
                code = %issue.error_code,
                severity = ?issue.severity,
                "validation rule failed"
            );
            let stop = issue.severity == Severity::Error && self.config.fail_fast;
            result.push(issue);
            if stop {
                break;
            }
        }

        Ok(result)
    }

    async fn check(
        &self,
        rule: &ValidationRule,
        ctx: &ValidationContext<'_>,
        merged: &Record,
    ) -> Result<Option<Failure>> {
        match &rule.kind {
            RuleKind::Field { field, .. } => {
                // Partial updates only revalidate fields they touch.
                if ctx.operation == Operation::Update && !ctx.record.contains_key(field) {
                    return Ok(None);
                }
                self.check_field(&rule.kind, merged.get(field))
            }
            RuleKind::CrossField {
                field,
                operator,
                compare_to,
                value,
            } => Ok(check_cross_field(merged, field, *operator, compare_to.as_deref(), value.as_ref())),
            RuleKind::StateMachine { field, transitions } => {
                Ok(check_transition(ctx, field, transitions))
            }
            RuleKind::Unique { fields } => self.check_unique(ctx, merged, fields).await,
            RuleKind::BusinessRule { condition } => Ok(self.check_business_rule(ctx, merged, condition)),
            RuleKind::Custom { validator, params } => {
                let found = self.validators.read().get(validator).cloned();
                let validator_impl = found
                    .ok_or_else(|| Error::Config(format!("no custom validator named '{}'", validator)))?;
                Ok(validator_impl
                    .validate(ctx, params.as_ref())
                    .await?
                    .map(|message| Failure::new("CUSTOM_RULE_FAILED", message)))
            }
            RuleKind::Dependency { field, requires } => {
                if is_blank(merged.get(field)) {
                    return Ok(None);
                }
                let missing: Vec<&str> = requires
                    .iter()
                    .filter(|r| is_blank(merged.get(r.as_str())))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Failure::new(
                        "MISSING_DEPENDENCY",
                        format!("{} requires {}", field, missing.join(", ")),
                    )))
                }
            }
        }
    }

    fn check_field(&self, kind: &RuleKind, value: Option<&Json>) -> Result<Option<Failure>> {
        let RuleKind::Field {
            field,
            required,
            min,
            max,
            min_length,
            max_length,
            pattern,
            format,
            one_of,
            operator,
            value: operand,
        } = kind
        else {
            return Ok(None);
        };

        if is_blank(value) {
            return Ok(required.then(|| Failure::new("REQUIRED", format!("{} is required", field))));
        }
        let value = value.unwrap_or(&Json::Null);

        if min.is_some() || max.is_some() {
            let Some(number) = as_number(value) else {
                return Ok(Some(Failure::new("INVALID_NUMBER", format!("{} must be a number", field))));
            };
            if let Some(min) = min.filter(|m| number < *m) {
                return Ok(Some(Failure::new("MIN_VALUE", format!("{} must be at least {}", field, min))));
            }
            if let Some(max) = max.filter(|m| number > *m) {
                return Ok(Some(Failure::new("MAX_VALUE", format!("{} must be at most {}", field, max))));
            }
        }

        if min_length.is_some() || max_length.is_some() {
            let length = match value {
                Json::String(s) => s.chars().count(),
                Json::Array(items) => items.len(),
                other => other.to_string().chars().count(),
            };
            if let Some(min) = min_length.filter(|m| length < *m) {
                return Ok(Some(Failure::new(
                    "MIN_LENGTH",
                    format!("{} must be at least {} characters", field, min),
                )));
            }
            if let Some(max) = max_length.filter(|m| length > *m) {
                return Ok(Some(Failure::new(
                    "MAX_LENGTH",
                    format!("{} must be at most {} characters", field, max),
                )));
            }
        }

        if let Some(pattern) = pattern {
            let regex = self.pattern(pattern)?;
            if !value.as_str().is_some_and(|s| regex.is_match(s)) {
                return Ok(Some(Failure::new(
                    "PATTERN_MISMATCH",
                    format!("{} does not match the required pattern", field),
                )));
            }
        }

        if let Some(format) = format {
            let regex = match format {
                FieldFormat::Email => self.pattern(EMAIL_PATTERN)?,
                FieldFormat::Url => self.pattern(URL_PATTERN)?,
            };
            if !value.as_str().is_some_and(|s| regex.is_match(s)) {
                let name = match format {
                    FieldFormat::Email => "email address",
                    FieldFormat::Url => "URL",
                };
                return Ok(Some(Failure::new(
                    "INVALID_FORMAT",
                    format!("{} must be a valid {}", field, name),
                )));
            }
        }

        if !one_of.is_empty() && !one_of.iter().any(|option| option_matches(option, value)) {
            return Ok(Some(Failure::new(
                "INVALID_OPTION",
                format!("{} is not an allowed value", field),
            )));
        }

        if let Some(operator) = operator {
            let operand = operand.as_ref().unwrap_or(&Json::Null);
            if !compare(Some(value), *operator, operand) {
                return Ok(Some(Failure::new(
                    "FIELD_COMPARISON_FAILED",
                    format!("{} must be {} {}", field, operator, operand),
                )));
            }
        }

        Ok(None)
    }

    async fn check_unique(
        &self,
        ctx: &ValidationContext<'_>,
        merged: &Record,
        fields: &[String],
    ) -> Result<Option<Failure>> {
        if ctx.operation == Operation::Update && !fields.iter().any(|f| ctx.record.contains_key(f)) {
            return Ok(None);
        }
        if fields.iter().any(|f| is_blank(merged.get(f))) {
            return Ok(None);
        }
        let Some(probe) = ctx.uniqueness else {
            debug!(object = ctx.object, "no uniqueness probe, skipping unique rule");
            return Ok(None);
        };

        let filter = fields
            .iter()
            .map(|f| Filter::eq(f.clone(), merged.get(f).cloned().unwrap_or(Json::Null)))
            .reduce(Filter::and)
            .unwrap_or(Filter::And(Vec::new()));

        if probe.exists(ctx.object, &filter, ctx.record_id).await? {
            Ok(Some(Failure::new(
                "DUPLICATE_VALUE",
                format!("a {} with this {} already exists", ctx.object, fields.join(", ")),
            )))
        } else {
            Ok(None)
        }
    }

    fn check_business_rule(&self, ctx: &ValidationContext<'_>, merged: &Record, condition: &str) -> Option<Failure> {
        let mut formula_ctx =
            FormulaContext::new(merged).with_is_new(ctx.operation == Operation::Create);
        if let Some(user) = ctx.user {
            formula_ctx = formula_ctx.with_user(user);
        }
        if let Some(id) = ctx.record_id {
            formula_ctx = formula_ctx.with_record_id(id);
        }

        match self.formulas.evaluate_condition(condition, &formula_ctx) {
            Ok(true) => None,
            Ok(false) => Some(Failure::new(
                "BUSINESS_RULE_FAILED",
                format!("condition '{}' is not satisfied", condition),
            )),
            Err(err) => Some(Failure::new(
                "BUSINESS_RULE_ERROR",
                format!("condition '{}' could not be evaluated: {}", condition, err),
            )),
        }
    }

    fn pattern(&self, pattern: &str) -> Result<Regex> {
        let mut patterns = self.patterns.lock();
        if let Some(regex) = patterns.get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            Error::Schema(SchemaError::InvalidDefinition {
                id: pattern.to_string(),
                message: e.to_string(),
            })
        })?;
        patterns.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationEngine")
            .field("validators", &self.validators.read().len())
            .field("config", &self.config)
            .finish()
    }
}

fn check_cross_field(
    merged: &Record,
    field: &str,
    operator: FilterOperator,
    compare_to: Option<&str>,
    value: Option<&Json>,
) -> Option<Failure> {
    let left = get_path(merged, field);
    let right = match compare_to {
        Some(other) => get_path(merged, other),
        None => value,
    };
    // Nothing to compare until both sides are present.
    let (Some(left), Some(right)) = (left, right) else {
        return None;
    };
    if left.is_null() || right.is_null() {
        return None;
    }
    if compare(Some(left), operator, right) {
        None
    } else {
        let target = compare_to.map(str::to_string).unwrap_or_else(|| right.to_string());
        Some(Failure::new(
            "CROSS_FIELD_FAILED",
            format!("{} must be {} {}", field, operator, target),
        ))
    }
}

fn check_transition(
    ctx: &ValidationContext<'_>,
    field: &str,
    transitions: &std::collections::BTreeMap<String, StateTransition>,
) -> Option<Failure> {
    let next = ctx.record.get(field)?;
    let previous = ctx.previous.and_then(|p| p.get(field))?;
    if previous.is_null() || values_equal(previous, next) {
        return None;
    }

    let from = state_name(previous);
    let to = state_name(next);
    let entry = transitions.get(&from)?;

    if entry.is_terminal {
        return Some(Failure::new(
            "INVALID_STATE_TRANSITION",
            format!("{} cannot change from terminal state '{}'", field, from),
        ));
    }
    if entry.allowed_next.iter().any(|s| *s == to) {
        None
    } else {
        Some(Failure::new(
            "INVALID_STATE_TRANSITION",
            format!("{} cannot change from '{}' to '{}'", field, from, to),
        ))
    }
}

fn state_name(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Select options are either bare values or `{value, label}` objects.
fn option_matches(option: &Json, value: &Json) -> bool {
    match option {
        Json::Object(map) => map.get("value").is_some_and(|v| values_equal(v, value)),
        other => values_equal(other, value),
    }
}

/// Rules implied by field definitions: required, ranges, lengths, pattern,
/// format, options and uniqueness.
pub fn field_rules(object: &ObjectDefinition) -> Vec<ValidationRule> {
    let mut rules = Vec::new();

    for field in object.fields.values() {
        if field.is_formula() {
            continue;
        }
        let constraints = &field.validation;
        let format = field.format();
        if !field.required && constraints.is_empty() && format.is_none() && field.options.is_empty() {
            continue;
        }
        rules.push(ValidationRule::new(
            format!("{}.{}", object.name, field.name),
            RuleKind::Field {
                field: field.name.clone(),
                required: field.required,
                min: constraints.min,
                max: constraints.max,
                min_length: constraints.min_length,
                max_length: constraints.max_length,
                pattern: constraints.pattern.clone(),
                format,
                one_of: field.options.clone(),
                operator: None,
                value: None,
            },
        ));
    }

    for fields in object.unique_field_sets() {
        rules.push(
            ValidationRule::unique(format!("{}.unique({})", object.name, fields.join(",")), fields)
                .with_error_code("DUPLICATE_VALUE"),
        );
    }

    rules
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::catalog::{FieldConstraints, FieldDefinition};
    use serde_json::json;

    fn record(value: Json) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> ValidationEngine {
        ValidationEngine::new(Arc::new(FormulaEngine::new()), ValidationConfig::default())
    }

    fn date_range() -> ValidationRule {
        ValidationRule::cross_field("date_range", "end_date", FilterOperator::Gte, "start_date")
            .with_message("End date must be after start date")
            .with_error_code("INVALID_DATE_RANGE")
    }

    fn status_flow() -> ValidationRule {
        let mut transitions = BTreeMap::new();
        transitions.insert("draft".to_string(), StateTransition::to(["submitted"]));
        transitions.insert("submitted".to_string(), StateTransition::to(["approved", "rejected"]));
        let mut closed = StateTransition::terminal();
        closed.allowed_next.push("draft".to_string());
        transitions.insert("closed".to_string(), closed);
        ValidationRule::state_machine("status_flow", "status", transitions)
    }

    #[tokio::test]
    async fn test_cross_field_on_create() {
        let engine = engine();
        let bad = record(json!({"start_date": "2024-12-31", "end_date": "2024-01-01"}));
        let result = engine
            .validate(&[date_range()], &ValidationContext::new("project", &bad, Operation::Create))
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors[0].error_code, "INVALID_DATE_RANGE");
        assert_eq!(result.errors[0].field.as_deref(), Some("end_date"));

        let good = record(json!({"start_date": "2024-01-01", "end_date": "2024-12-31"}));
        let result = engine
            .validate(&[date_range()], &ValidationContext::new("project", &good, Operation::Create))
            .await
            .unwrap();
        assert!(result.valid);
    }

    #[tokio::test]
    async fn test_cross_field_uses_merged_record() {
        let engine = engine();
        let stored = record(json!({"name": "a", "start_date": "2024-01-01", "end_date": "2024-06-30"}));
        let update = record(json!({"name": "b"}));
        let ctx = ValidationContext::new("project", &update, Operation::Update).with_previous(&stored);
        assert!(engine.validate(&[date_range()], &ctx).await.unwrap().valid);

        let update = record(json!({"end_date": "2023-12-31"}));
        let ctx = ValidationContext::new("project", &update, Operation::Update).with_previous(&stored);
        let result = engine.validate(&[date_range()], &ctx).await.unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let engine = engine();
        let rules = [status_flow()];
        let cases = [
            ("draft", "submitted", true),
            ("draft", "approved", false),
            ("submitted", "submitted", true),
            ("closed", "draft", false),
            ("closed", "closed", true),
            ("archived", "draft", true),
        ];
        for (from, to, expected) in cases {
            let stored = record(json!({"status": from}));
            let update = record(json!({"status": to}));
            let ctx = ValidationContext::new("ticket", &update, Operation::Update).with_previous(&stored);
            let result = engine.validate(&rules, &ctx).await.unwrap();
            assert_eq!(result.valid, expected, "{} -> {}", from, to);
            if !expected {
                assert_eq!(result.errors[0].error_code, "INVALID_STATE_TRANSITION");
            }
        }

        let stored = record(json!({"status": "closed"}));
        let update = record(json!({"title": "renamed"}));
        let ctx = ValidationContext::new("ticket", &update, Operation::Update).with_previous(&stored);
        assert!(engine.validate(&rules, &ctx).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_collects_all_errors_unless_fail_fast() {
        let rules = vec![
            ValidationRule::required("name_required", "name"),
            ValidationRule::required("owner_required", "owner"),
        ];
        let data = record(json!({}));
        let ctx = ValidationContext::new("task", &data, Operation::Create);

        let result = engine().validate(&rules, &ctx).await.unwrap();
        assert_eq!(result.errors.len(), 2);

        let fail_fast = ValidationEngine::new(
            Arc::new(FormulaEngine::new()),
            ValidationConfig::default().with_fail_fast(true),
        );
        let result = fail_fast.validate(&rules, &ctx).await.unwrap();
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_severity_and_triggers() {
        let rules = vec![
            ValidationRule::business_rule("big_budget", "budget < 1000").with_severity(Severity::Warning),
            ValidationRule::required("reason", "reason").with_trigger(&[Operation::Delete]),
        ];
        let data = record(json!({"budget": 5000}));
        let result = engine()
            .validate(&rules, &ValidationContext::new("project", &data, Operation::Create))
            .await
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].error_code, "BUSINESS_RULE_FAILED");
    }

    #[tokio::test]
    async fn test_when_guard_and_dependency() {
        let rule = ValidationRule::new(
            "discount_reason",
            RuleKind::Dependency {
                field: "discount".into(),
                requires: vec!["discount_reason".into()],
            },
        )
        .with_when(Filter::ne("status", "draft"));

        let draft = record(json!({"status": "draft", "discount": 10}));
        let ctx = ValidationContext::new("quote", &draft, Operation::Create);
        assert!(engine().validate(&[rule.clone()], &ctx).await.unwrap().valid);

        let sent = record(json!({"status": "sent", "discount": 10}));
        let ctx = ValidationContext::new("quote", &sent, Operation::Create);
        let result = engine().validate(&[rule], &ctx).await.unwrap();
        assert_eq!(result.errors[0].error_code, "MISSING_DEPENDENCY");
    }

    #[tokio::test]
    async fn test_implicit_field_rules() {
        let object = ObjectDefinition::new("contact")
            .with_field("name", FieldDefinition::text().required())
            .with_field(
                "email",
                FieldDefinition::new(crate::catalog::FieldType::Email),
            )
            .with_field(
                "age",
                FieldDefinition::number().with_constraints(FieldConstraints {
                    min: Some(0.0),
                    max: Some(150.0),
                    ..Default::default()
                }),
            )
            .with_field(
                "code",
                FieldDefinition::text().with_constraints(FieldConstraints {
                    pattern: Some("[A-Z]{3}".into()),
                    ..Default::default()
                }),
            );
        let rules = field_rules(&object);

        let data = record(json!({"email": "not-an-email", "age": 200, "code": "abc"}));
        let result = engine()
            .validate(&rules, &ValidationContext::new("contact", &data, Operation::Create))
            .await
            .unwrap();
        let mut codes: Vec<_> = result.errors.iter().map(|e| e.error_code.as_str()).collect();
        codes.sort();
        assert_eq!(codes, vec!["INVALID_FORMAT", "MAX_VALUE", "PATTERN_MISMATCH", "REQUIRED"]);

        let data = record(json!({"name": "Ada", "email": "ada@example.com", "age": 36, "code": "ABC"}));
        let result = engine()
            .validate(&rules, &ValidationContext::new("contact", &data, Operation::Create))
            .await
            .unwrap();
        assert!(result.valid, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn test_partial_update_skips_untouched_fields() {
        let rules = vec![ValidationRule::required("name_required", "name")];
        let stored = record(json!({"name": "Ada"}));
        let update = record(json!({"age": 3}));
        let ctx = ValidationContext::new("contact", &update, Operation::Update).with_previous(&stored);
        assert!(engine().validate(&rules, &ctx).await.unwrap().valid);

        let update = record(json!({"name": null}));
        let ctx = ValidationContext::new("contact", &update, Operation::Update).with_previous(&stored);
        assert!(!engine().validate(&rules, &ctx).await.unwrap().valid);
    }

    struct Taken;

    #[async_trait::async_trait]
    impl UniquenessProbe for Taken {
        async fn exists(&self, _object: &str, filter: &Filter, exclude_id: Option<&str>) -> Result<bool> {
            let taken = record(json!({"id": "1", "email": "ada@example.com"}));
            Ok(matches(&taken, filter) && exclude_id != Some("1"))
        }
    }

    #[tokio::test]
    async fn test_unique_rule_uses_probe() {
        let rules = vec![ValidationRule::unique("email_unique", ["email"])];
        let probe = Taken;

        let data = record(json!({"email": "ada@example.com"}));
        let ctx = ValidationContext::new("contact", &data, Operation::Create).with_uniqueness(&probe);
        let result = engine().validate(&rules, &ctx).await.unwrap();
        assert_eq!(result.errors[0].error_code, "DUPLICATE_VALUE");

        let ctx = ValidationContext::new("contact", &data, Operation::Update)
            .with_uniqueness(&probe)
            .with_record_id("1");
        assert!(engine().validate(&rules, &ctx).await.unwrap().valid);
    }

    struct NoWeekends;

    #[async_trait::async_trait]
    impl CustomValidator for NoWeekends {
        async fn validate(&self, ctx: &ValidationContext<'_>, _params: Option<&Json>) -> Result<Option<String>> {
            let day = ctx.record.get("day").and_then(Json::as_str).unwrap_or_default();
            Ok((day == "saturday" || day == "sunday").then(|| "no weekend bookings".to_string()))
        }
    }

    #[tokio::test]
    async fn test_custom_validator_dispatch() {
        let engine = engine();
        let rule = ValidationRule::new(
            "weekday_only",
            RuleKind::Custom {
                validator: "no_weekends".into(),
                params: None,
            },
        );
        let data = record(json!({"day": "sunday"}));
        let ctx = ValidationContext::new("booking", &data, Operation::Create);

        let err = engine.validate(&[rule.clone()], &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);

        engine.register_validator("no_weekends", Arc::new(NoWeekends));
        let result = engine.validate(&[rule], &ctx).await.unwrap();
        assert_eq!(result.errors[0].message, "no weekend bookings");
        assert_eq!(result.errors[0].error_code, "CUSTOM_RULE_FAILED");
    }
}
