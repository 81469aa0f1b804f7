//! Tree-walking evaluator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde_json::{Map, Value as Json};

use crate::ast::{BinaryOp, Expr, ExprKind, LogicalOp, UnaryOp};
use crate::builtins::{call_builtin, check_arity};
use crate::error::FormulaError;
use crate::value::Value;

/// System variables available as `$name`.
pub const SYSTEM_VARIABLES: &[&str] = &[
    "today",
    "now",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "current_user",
    "is_new",
    "record_id",
];

/// A host-registered function. Errors are reported as
/// [`FormulaError::Function`].
pub type CustomFunction = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Read access to the record a formula is evaluated against.
pub trait FieldSource {
    /// Value of a top-level field, if present.
    fn field(&self, name: &str) -> Option<Json>;
}

impl FieldSource for Map<String, Json> {
    fn field(&self, name: &str) -> Option<Json> {
        self.get(name).cloned()
    }
}

impl FieldSource for Json {
    fn field(&self, name: &str) -> Option<Json> {
        self.as_object().and_then(|map| map.get(name).cloned())
    }
}

/// Everything a formula can observe besides its own text.
pub struct FormulaContext<'a> {
    pub record: &'a dyn FieldSource,
    pub user: Option<&'a Map<String, Json>>,
    pub is_new: bool,
    pub record_id: Option<String>,
    pub now: DateTime<Utc>,
}

impl<'a> FormulaContext<'a> {
    /// Context over a record, evaluated at the current time.
    pub fn new(record: &'a dyn FieldSource) -> Self {
        Self {
            record,
            user: None,
            is_new: false,
            record_id: None,
            now: Utc::now(),
        }
    }

    pub fn with_user(mut self, user: &'a Map<String, Json>) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_is_new(mut self, is_new: bool) -> Self {
        self.is_new = is_new;
        self
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    /// Pin the clock, mainly for tests.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Evaluates expressions against a context.
pub struct Interpreter<'a> {
    ctx: &'a FormulaContext<'a>,
    functions: &'a HashMap<String, CustomFunction>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a FormulaContext<'a>, functions: &'a HashMap<String, CustomFunction>) -> Self {
        Self { ctx, functions }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, FormulaError> {
        match &expr.kind {
            ExprKind::Number(n) => Ok(Value::Number(*n)),
            ExprKind::Text(s) => Ok(Value::Text(s.clone())),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Field(path) => Ok(self.field(path)),
            ExprKind::System { name, path } => self.system(name, path),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.as_number().unwrap_or(f64::NAN)),
                    UnaryOp::Plus => Value::Number(value.as_number().unwrap_or(f64::NAN)),
                })
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(binary(*op, &left, &right))
            }
            ExprKind::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    LogicalOp::And if !left.truthy() => Ok(Value::Bool(false)),
                    LogicalOp::Or if left.truthy() => Ok(Value::Bool(true)),
                    LogicalOp::And | LogicalOp::Or => Ok(Value::Bool(self.eval(right)?.truthy())),
                    LogicalOp::Coalesce if !left.is_null() => Ok(left),
                    LogicalOp::Coalesce => self.eval(right),
                }
            }
            ExprKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition)?.truthy() {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            ExprKind::Call { function, args } => self.call(function, args),
        }
    }

    fn field(&self, path: &[String]) -> Value {
        let Some((first, rest)) = path.split_first() else {
            return Value::Null;
        };
        let Some(root) = self.ctx.record.field(first) else {
            return Value::Null;
        };
        navigate(&root, rest)
    }

    fn system(&self, name: &str, path: &[String]) -> Result<Value, FormulaError> {
        let now = self.ctx.now;
        let value = match name {
            "today" => Value::Date(now.date_naive()),
            "now" => Value::DateTime(now),
            "year" => Value::Number(now.year() as f64),
            "month" => Value::Number(now.month() as f64),
            "day" => Value::Number(now.day() as f64),
            "hour" => Value::Number(now.hour() as f64),
            "minute" => Value::Number(now.minute() as f64),
            "second" => Value::Number(now.second() as f64),
            "current_user" => {
                return Ok(match self.ctx.user {
                    Some(user) => match path.split_first() {
                        Some((first, rest)) => user
                            .get(first)
                            .map(|v| navigate(v, rest))
                            .unwrap_or(Value::Null),
                        None => Value::from_json(&Json::Object(user.clone())),
                    },
                    None => Value::Null,
                })
            }
            "is_new" => Value::Bool(self.ctx.is_new),
            "record_id" => self
                .ctx
                .record_id
                .as_ref()
                .map(|id| Value::Text(id.clone()))
                .unwrap_or(Value::Null),
            other => return Err(FormulaError::UnknownVariable(other.to_string())),
        };
        if path.is_empty() {
            Ok(value)
        } else {
            Ok(Value::Null)
        }
    }

    fn call(&self, function: &str, args: &[Expr]) -> Result<Value, FormulaError> {
        if function == "if" {
            check_arity("if", args.len(), 2, 3)?;
            return if self.eval(&args[0])?.truthy() {
                self.eval(&args[1])
            } else {
                match args.get(2) {
                    Some(otherwise) => self.eval(otherwise),
                    None => Ok(Value::Null),
                }
            };
        }

        let values = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(result) = call_builtin(function, &values, self.ctx.now) {
            return result;
        }

        match self.functions.get(function) {
            Some(custom) => custom(&values).map_err(|message| FormulaError::Function {
                function: function.to_string(),
                message,
            }),
            None => Err(FormulaError::UnknownFunction(function.to_string())),
        }
    }
}

fn navigate(root: &Json, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        match current.as_object().and_then(|map| map.get(segment)) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    Value::from_json(current)
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => subtract(left, right),
        BinaryOp::Mul => numeric(left, right, |a, b| a * b),
        BinaryOp::Div => numeric(left, right, |a, b| a / b),
        BinaryOp::Rem => numeric(left, right, |a, b| a % b),
        BinaryOp::Eq => Value::Bool(left.loose_eq(right)),
        BinaryOp::Ne => Value::Bool(!left.loose_eq(right)),
        BinaryOp::StrictEq => Value::Bool(left.strict_eq(right)),
        BinaryOp::StrictNe => Value::Bool(!left.strict_eq(right)),
        BinaryOp::Lt => Value::Bool(left.compare(right).is_some_and(|o| o.is_lt())),
        BinaryOp::Le => Value::Bool(left.compare(right).is_some_and(|o| o.is_le())),
        BinaryOp::Gt => Value::Bool(left.compare(right).is_some_and(|o| o.is_gt())),
        BinaryOp::Ge => Value::Bool(left.compare(right).is_some_and(|o| o.is_ge())),
    }
}

/// Numbers treat null as zero; anything non-numeric yields NaN.
fn numeric(left: &Value, right: &Value, f: fn(f64, f64) -> f64) -> Value {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Value::Number(f(a, b)),
        _ => Value::Number(f64::NAN),
    }
}

fn add(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Date(d), Value::Number(n)) | (Value::Number(n), Value::Date(d)) => {
            shift_days(*d, *n).map(Value::Date).unwrap_or(Value::Null)
        }
        (Value::DateTime(dt), Value::Number(n)) | (Value::Number(n), Value::DateTime(dt)) => {
            dt.checked_add_signed(Duration::days(n.trunc() as i64))
                .map(Value::DateTime)
                .unwrap_or(Value::Null)
        }
        (Value::Text(_), _) | (_, Value::Text(_)) => {
            Value::Text(format!("{}{}", left.display_string(), right.display_string()))
        }
        _ => numeric(left, right, |a, b| a + b),
    }
}

fn subtract(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Date(d), Value::Number(n)) => shift_days(*d, -*n).map(Value::Date).unwrap_or(Value::Null),
        (Value::DateTime(dt), Value::Number(n)) => dt
            .checked_sub_signed(Duration::days(n.trunc() as i64))
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        (Value::Date(_) | Value::DateTime(_), _) | (_, Value::Date(_) | Value::DateTime(_)) => {
            match (left.as_date(), right.as_date()) {
                (Some(a), Some(b)) => Value::Number((a - b).num_days() as f64),
                _ => Value::Number(f64::NAN),
            }
        }
        _ => numeric(left, right, |a, b| a - b),
    }
}

fn shift_days(date: chrono::NaiveDate, days: f64) -> Option<chrono::NaiveDate> {
    if !days.is_finite() {
        return None;
    }
    date.checked_add_signed(Duration::days(days.trunc() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    fn eval_with(source: &str, record: Json) -> Result<Value, FormulaError> {
        let expr = parse(source)?;
        let functions = HashMap::new();
        let ctx = FormulaContext::new(&record).with_now(Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap());
        Interpreter::new(&ctx, &functions).eval(&expr)
    }

    fn eval(source: &str) -> Value {
        eval_with(source, json!({})).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("2 + 3 * 4"), Value::Number(14.0));
        assert_eq!(eval("(2 + 3) * 4"), Value::Number(20.0));
        assert_eq!(eval("10 % 4 - -1"), Value::Number(3.0));
    }

    #[test]
    fn test_null_is_zero_in_arithmetic() {
        assert_eq!(eval_with("qty * 2", json!({"qty": null})).unwrap(), Value::Number(0.0));
        assert_eq!(eval_with("missing + 1", json!({})).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_text_concatenation() {
        assert_eq!(
            eval_with("first + ' ' + last", json!({"first": "Ada", "last": "Lovelace"})).unwrap(),
            Value::Text("Ada Lovelace".into())
        );
        assert_eq!(eval("'n=' + 3"), Value::Text("n=3".into()));
        assert_eq!(eval("'x' + null"), Value::Text("xnull".into()));
    }

    #[test]
    fn test_date_arithmetic() {
        assert_eq!(
            eval("today() + 10"),
            Value::Date(NaiveDate::from_ymd_opt(2024, 6, 25).unwrap())
        );
        assert_eq!(
            eval_with(
                "dateAdd(end, 0) - dateAdd(start, 0)",
                json!({"start": "2024-01-01", "end": "2024-01-31"})
            )
            .unwrap(),
            Value::Number(30.0)
        );
    }

    #[test]
    fn test_logical_operators() {
        assert_eq!(eval("1 && 'x'"), Value::Bool(true));
        assert_eq!(eval("0 || ''"), Value::Bool(false));
        assert_eq!(eval("null ?? 5"), Value::Number(5.0));
        assert_eq!(eval("0 ?? 5"), Value::Number(0.0));
        assert_eq!(eval("!0"), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("false && undefinedFn()"), Value::Bool(false));
        assert_eq!(eval("if(true, 1, undefinedFn())"), Value::Number(1.0));
        assert!(matches!(
            eval_with("undefinedFn()", json!({})),
            Err(FormulaError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("3 > 2"), Value::Bool(true));
        assert_eq!(eval("'5' == 5"), Value::Bool(true));
        assert_eq!(eval("'5' === 5"), Value::Bool(false));
        assert_eq!(eval("null < 1"), Value::Bool(true));
        assert_eq!(eval("'abc' < 1"), Value::Bool(false));
    }

    #[test]
    fn test_lookup_chain() {
        let record = json!({"account": {"owner": {"name": "Grace"}}});
        assert_eq!(
            eval_with("upper(account.owner.name)", record.clone()).unwrap(),
            Value::Text("GRACE".into())
        );
        assert_eq!(eval_with("account.missing.name", record).unwrap(), Value::Null);
    }

    #[test]
    fn test_system_variables() {
        let record = json!({});
        let user = json!({"name": "ops"});
        let user = user.as_object().unwrap();
        let functions = HashMap::new();
        let ctx = FormulaContext::new(&record)
            .with_user(user)
            .with_is_new(true)
            .with_record_id("r-1")
            .with_now(Utc.with_ymd_and_hms(2024, 6, 15, 9, 5, 7).unwrap());
        let interp = Interpreter::new(&ctx, &functions);

        let run = |s: &str| interp.eval(&parse(s).unwrap());
        assert_eq!(run("$current_user.name").unwrap(), Value::Text("ops".into()));
        assert_eq!(run("$is_new").unwrap(), Value::Bool(true));
        assert_eq!(run("$record_id").unwrap(), Value::Text("r-1".into()));
        assert_eq!(run("$year * 100 + $month").unwrap(), Value::Number(202406.0));
        assert_eq!(run("$minute + $second").unwrap(), Value::Number(12.0));
        assert!(matches!(run("$secret"), Err(FormulaError::UnknownVariable(_))));
    }

    #[test]
    fn test_custom_function() {
        let record = json!({"amount": 50});
        let mut functions: HashMap<String, CustomFunction> = HashMap::new();
        functions.insert(
            "tax".into(),
            Arc::new(|args: &[Value]| match args.first().and_then(Value::as_number) {
                Some(n) => Ok(Value::Number(n * 0.2)),
                None => Err("tax expects a number".to_string()),
            }),
        );
        let ctx = FormulaContext::new(&record);
        let interp = Interpreter::new(&ctx, &functions);
        assert_eq!(interp.eval(&parse("tax(amount)").unwrap()).unwrap(), Value::Number(10.0));
        assert!(matches!(
            interp.eval(&parse("tax('x')").unwrap()),
            Err(FormulaError::Function { .. })
        ));
    }
}
