//! Formula engine: parse cache, function registry and result coercion.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ast::{Expr, ExprKind};
use crate::builtins::is_builtin;
use crate::error::FormulaError;
use crate::interpreter::{CustomFunction, FormulaContext, Interpreter};
use crate::metadata::{extract_metadata, FormulaMetadata};
use crate::parser::{is_blocked_identifier, parse};
use crate::value::{number_json, Value};

/// Declared result type of a formula field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormulaType {
    #[default]
    Text,
    Number,
    /// Number rounded to two decimals.
    Currency,
    Percent,
    Boolean,
    Date,
    Datetime,
}

impl FormulaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormulaType::Text => "text",
            FormulaType::Number => "number",
            FormulaType::Currency => "currency",
            FormulaType::Percent => "percent",
            FormulaType::Boolean => "boolean",
            FormulaType::Date => "date",
            FormulaType::Datetime => "datetime",
        }
    }

    /// Map a field type name; unknown names fall back to text.
    pub fn from_field_type(name: &str) -> Self {
        match name {
            "number" | "integer" | "float" | "decimal" => FormulaType::Number,
            "currency" => FormulaType::Currency,
            "percent" => FormulaType::Percent,
            "boolean" => FormulaType::Boolean,
            "date" => FormulaType::Date,
            "datetime" => FormulaType::Datetime,
            _ => FormulaType::Text,
        }
    }

    /// Convert an evaluated value to this type. Null stays null.
    pub fn coerce(&self, value: Value) -> Result<Json, FormulaError> {
        if value.is_null() {
            return Ok(Json::Null);
        }
        let fail = |value: &Value| FormulaError::Coercion {
            value: format!("{} '{}'", value.type_name(), value),
            target: self.as_str().to_string(),
        };

        match self {
            FormulaType::Text => Ok(Json::String(value.display_string())),
            FormulaType::Boolean => Ok(Json::Bool(value.truthy())),
            FormulaType::Number | FormulaType::Percent | FormulaType::Currency => {
                let n = match &value {
                    Value::Date(_) | Value::DateTime(_) | Value::List(_) | Value::Object(_) => None,
                    other => other.as_number(),
                }
                .filter(|n| n.is_finite())
                .ok_or_else(|| fail(&value))?;
                let n = if *self == FormulaType::Currency {
                    (n * 100.0).round() / 100.0
                } else {
                    n
                };
                Ok(number_json(n))
            }
            FormulaType::Date => value
                .as_date()
                .map(|d| Value::Date(d).to_json())
                .ok_or_else(|| fail(&value)),
            FormulaType::Datetime => value
                .as_datetime()
                .map(|dt| Value::DateTime(dt).to_json())
                .ok_or_else(|| fail(&value)),
        }
    }
}

impl fmt::Display for FormulaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sandboxed formula evaluator.
///
/// Parsed expressions are cached by source text, so repeated evaluation of
/// the same field formula only walks the tree.
pub struct FormulaEngine {
    cache: DashMap<String, Arc<Expr>>,
    functions: RwLock<HashMap<String, CustomFunction>>,
}

impl FormulaEngine {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a custom function.
    ///
    /// Names may not shadow builtins or blocked identifiers. Re-registering
    /// a custom name replaces it.
    pub fn register_function<F>(&self, name: impl Into<String>, function: F) -> Result<(), FormulaError>
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        let name = name.into();
        if is_blocked_identifier(&name) {
            return Err(FormulaError::blocked(name, Default::default()));
        }
        if is_builtin(&name) {
            return Err(FormulaError::Type(format!(
                "cannot register '{}': it is a builtin function",
                name
            )));
        }
        tracing::debug!(function = %name, "registered formula function");
        self.functions.write().insert(name, Arc::new(function));
        Ok(())
    }

    /// Remove a custom function.
    pub fn unregister_function(&self, name: &str) -> bool {
        self.functions.write().remove(name).is_some()
    }

    /// Whether `name` resolves to a builtin or a registered function.
    pub fn has_function(&self, name: &str) -> bool {
        is_builtin(name) || self.functions.read().contains_key(name)
    }

    /// Parse and check a formula, returning the cached tree.
    ///
    /// Unknown functions are rejected here so a bad formula is caught when
    /// its field is registered instead of on every read.
    pub fn compile(&self, source: &str) -> Result<Arc<Expr>, FormulaError> {
        if let Some(expr) = self.cache.get(source) {
            return Ok(expr.clone());
        }

        let expr = parse(source)?;
        let mut unknown = None;
        expr.walk(&mut |node| {
            if let ExprKind::Call { function, .. } = &node.kind {
                if unknown.is_none() && !self.has_function(function) {
                    unknown = Some(function.clone());
                }
            }
        });
        if let Some(function) = unknown {
            return Err(FormulaError::UnknownFunction(function));
        }

        let expr = Arc::new(expr);
        self.cache.insert(source.to_string(), expr.clone());
        Ok(expr)
    }

    /// Evaluate a formula and coerce the result to `target`.
    pub fn evaluate(
        &self,
        source: &str,
        ctx: &FormulaContext<'_>,
        target: FormulaType,
    ) -> Result<Json, FormulaError> {
        let expr = self.compile(source)?;
        self.evaluate_expr(&expr, ctx, target)
    }

    /// Evaluate a pre-compiled expression.
    pub fn evaluate_expr(
        &self,
        expr: &Expr,
        ctx: &FormulaContext<'_>,
        target: FormulaType,
    ) -> Result<Json, FormulaError> {
        let functions = self.functions.read();
        let value = Interpreter::new(ctx, &functions).eval(expr)?;
        target.coerce(value)
    }

    /// Evaluate a formula as a condition, without coercing.
    pub fn evaluate_condition(&self, source: &str, ctx: &FormulaContext<'_>) -> Result<bool, FormulaError> {
        let expr = self.compile(source)?;
        let functions = self.functions.read();
        Ok(Interpreter::new(ctx, &functions).eval(&expr)?.truthy())
    }

    /// Static analysis; never evaluates.
    pub fn extract_metadata(
        &self,
        field: &str,
        source: &str,
        target: FormulaType,
    ) -> Result<FormulaMetadata, FormulaError> {
        let expr = parse(source)?;
        extract_metadata(field, &expr, target)
    }

    /// Number of cached parse trees.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl Default for FormulaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FormulaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaEngine")
            .field("cached", &self.cache.len())
            .field("functions", &self.functions.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormulaErrorKind;
    use serde_json::json;

    fn record(value: Json) -> serde_json::Map<String, Json> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_total_as_currency() {
        let engine = FormulaEngine::new();
        let rec = record(json!({"quantity": 10, "unit_price": 25.5}));
        let ctx = FormulaContext::new(&rec);
        let total = engine
            .evaluate("quantity * unit_price", &ctx, FormulaType::Currency)
            .unwrap();
        assert_eq!(total, json!(255));
        assert!(total.is_i64());
    }

    #[test]
    fn test_currency_rounds() {
        let engine = FormulaEngine::new();
        let rec = record(json!({"a": 10, "b": 3}));
        let ctx = FormulaContext::new(&rec);
        assert_eq!(engine.evaluate("a / b", &ctx, FormulaType::Currency).unwrap(), json!(3.33));
    }

    #[test]
    fn test_coercion_failures() {
        let engine = FormulaEngine::new();
        let rec = record(json!({"name": "widget", "n": 0}));
        let ctx = FormulaContext::new(&rec);

        let err = engine.evaluate("name", &ctx, FormulaType::Number).unwrap_err();
        assert_eq!(err.kind(), FormulaErrorKind::Coercion);

        let err = engine.evaluate("1 / n", &ctx, FormulaType::Number).unwrap_err();
        assert_eq!(err.kind(), FormulaErrorKind::Coercion);

        let err = engine.evaluate("name", &ctx, FormulaType::Date).unwrap_err();
        assert_eq!(err.kind(), FormulaErrorKind::Coercion);
    }

    #[test]
    fn test_other_targets() {
        let engine = FormulaEngine::new();
        let rec = record(json!({"start": "2024-02-28", "qty": 3, "missing_ok": null}));
        let ctx = FormulaContext::new(&rec);

        assert_eq!(engine.evaluate("start + 0", &ctx, FormulaType::Text).unwrap(), json!("2024-02-280"));
        assert_eq!(
            engine.evaluate("dateAdd(start, 2)", &ctx, FormulaType::Date).unwrap(),
            json!("2024-03-01")
        );
        assert_eq!(engine.evaluate("qty > 2", &ctx, FormulaType::Boolean).unwrap(), json!(true));
        assert_eq!(engine.evaluate("missing_ok", &ctx, FormulaType::Number).unwrap(), Json::Null);
        assert_eq!(
            engine.evaluate("start", &ctx, FormulaType::Datetime).unwrap(),
            json!("2024-02-28T00:00:00.000Z")
        );
    }

    #[test]
    fn test_null_coalescing_guard() {
        let engine = FormulaEngine::new();
        let rec = record(json!({"discount": null}));
        let ctx = FormulaContext::new(&rec);
        assert_eq!(
            engine.evaluate("(discount ?? 5) * 2", &ctx, FormulaType::Number).unwrap(),
            json!(10)
        );
    }

    #[test]
    fn test_compile_caches_and_validates() {
        let engine = FormulaEngine::new();
        let first = engine.compile("a + b").unwrap();
        let second = engine.compile("a + b").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cached_len(), 1);

        let err = engine.compile("mystery(a)").unwrap_err();
        assert_eq!(err, FormulaError::UnknownFunction("mystery".into()));
        assert_eq!(engine.cached_len(), 1);
    }

    #[test]
    fn test_blocked_operation_is_distinguishable() {
        let engine = FormulaEngine::new();
        let rec = record(json!({}));
        let ctx = FormulaContext::new(&rec);
        let err = engine
            .evaluate("require('child_process')", &ctx, FormulaType::Text)
            .unwrap_err();
        assert_eq!(err.kind(), FormulaErrorKind::BlockedOperation);
    }

    #[test]
    fn test_custom_function_registration() {
        let engine = FormulaEngine::new();
        engine
            .register_function("double", |args: &[Value]| {
                args.first()
                    .and_then(Value::as_number)
                    .map(|n| Value::Number(n * 2.0))
                    .ok_or_else(|| "double expects a number".to_string())
            })
            .unwrap();
        assert!(engine.has_function("double"));

        let rec = record(json!({"x": 21}));
        let ctx = FormulaContext::new(&rec);
        assert_eq!(engine.evaluate("double(x)", &ctx, FormulaType::Number).unwrap(), json!(42));

        assert!(engine.register_function("round", |_: &[Value]| Ok(Value::Null)).is_err());
        assert!(engine
            .register_function("eval", |_: &[Value]| Ok(Value::Null))
            .unwrap_err()
            .is_blocked());
    }

    #[test]
    fn test_field_type_mapping() {
        assert_eq!(FormulaType::from_field_type("currency"), FormulaType::Currency);
        assert_eq!(FormulaType::from_field_type("lookup"), FormulaType::Text);
        let parsed: FormulaType = serde_json::from_value(json!("datetime")).unwrap();
        assert_eq!(parsed, FormulaType::Datetime);
    }
}
