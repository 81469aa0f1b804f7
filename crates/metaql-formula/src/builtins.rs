//! Whitelisted builtin functions.
//!
//! Everything callable from a formula is listed here or registered on the
//! engine explicitly. `if` is special-cased by the interpreter because it
//! evaluates lazily.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Timelike, Utc};

use crate::error::FormulaError;
use crate::value::Value;

/// Names of every builtin function.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    // math
    "abs", "round", "floor", "ceil", "min", "max", "sqrt", "pow", // text
    "len", "upper", "lower", "trim", "concat", "substring", "contains", "startsWith",
    "endsWith", "replace", "text", // date
    "today", "now", "year", "month", "day", "hour", "dateAdd", "dateDiff", // logic
    "if", "isNull", "isBlank", "coalesce", "number",
];

/// Whether `name` is a builtin.
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_FUNCTIONS.contains(&name)
}

/// Call a builtin with already-evaluated arguments.
///
/// Returns `None` when `name` is not an eagerly evaluated builtin.
pub fn call_builtin(name: &str, args: &[Value], now: DateTime<Utc>) -> Option<Result<Value, FormulaError>> {
    let result = match name {
        "abs" => unary_math(name, args, f64::abs),
        "floor" => unary_math(name, args, f64::floor),
        "ceil" => unary_math(name, args, f64::ceil),
        "sqrt" => unary_math(name, args, f64::sqrt),
        "round" => round(args),
        "pow" => arity(name, args, 2, 2).and_then(|_| {
            Ok(Value::Number(number_arg(name, &args[0])?.powf(number_arg(name, &args[1])?)))
        }),
        "min" => extreme(name, args, std::cmp::Ordering::Less),
        "max" => extreme(name, args, std::cmp::Ordering::Greater),

        "len" => arity(name, args, 1, 1).map(|_| match &args[0] {
            Value::Null => Value::Number(0.0),
            Value::List(items) => Value::Number(items.len() as f64),
            other => Value::Number(other.display_string().chars().count() as f64),
        }),
        "upper" => text_map(name, args, |s| s.to_uppercase()),
        "lower" => text_map(name, args, |s| s.to_lowercase()),
        "trim" => text_map(name, args, |s| s.trim().to_string()),
        "text" => arity(name, args, 1, 1).map(|_| match &args[0] {
            Value::Null => Value::Null,
            other => Value::Text(other.display_string()),
        }),
        "concat" => Ok(Value::Text(
            args.iter()
                .filter(|v| !v.is_null())
                .map(Value::display_string)
                .collect(),
        )),
        "substring" => substring(args),
        "contains" => text_predicate(name, args, |s, p| s.contains(p)),
        "startsWith" => text_predicate(name, args, |s, p| s.starts_with(p)),
        "endsWith" => text_predicate(name, args, |s, p| s.ends_with(p)),
        "replace" => arity(name, args, 3, 3).map(|_| match &args[0] {
            Value::Null => Value::Null,
            s => Value::Text(
                s.display_string()
                    .replace(&args[1].display_string(), &args[2].display_string()),
            ),
        }),

        "today" => arity(name, args, 0, 0).map(|_| Value::Date(now.date_naive())),
        "now" => arity(name, args, 0, 0).map(|_| Value::DateTime(now)),
        "year" => date_part(name, args, |d| d.year() as f64),
        "month" => date_part(name, args, |d| d.month() as f64),
        "day" => date_part(name, args, |d| d.day() as f64),
        "hour" => arity(name, args, 1, 1).and_then(|_| match &args[0] {
            Value::Null => Ok(Value::Null),
            v => v
                .as_datetime()
                .map(|dt| Value::Number(dt.hour() as f64))
                .ok_or_else(|| type_error(name, "a date or datetime", v)),
        }),
        "dateAdd" => date_add(args),
        "dateDiff" => date_diff(args),

        "isNull" => arity(name, args, 1, 1).map(|_| Value::Bool(args[0].is_null())),
        "isBlank" => arity(name, args, 1, 1).map(|_| {
            Value::Bool(match &args[0] {
                Value::Null => true,
                Value::Text(s) => s.trim().is_empty(),
                Value::List(items) => items.is_empty(),
                _ => false,
            })
        }),
        "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        "number" => arity(name, args, 1, 1).and_then(|_| match &args[0] {
            Value::Null => Ok(Value::Null),
            v => v
                .as_number()
                .map(Value::Number)
                .ok_or_else(|| type_error(name, "a numeric value", v)),
        }),
        _ => return None,
    };
    Some(result)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), FormulaError> {
    check_arity(name, args.len(), min, max)
}

pub(crate) fn check_arity(name: &str, got: usize, min: usize, max: usize) -> Result<(), FormulaError> {
    if got < min || got > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}..={}", min, max)
        };
        return Err(FormulaError::Arity {
            function: name.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

fn type_error(name: &str, expected: &str, got: &Value) -> FormulaError {
    FormulaError::Type(format!(
        "{}() expects {}, got {} '{}'",
        name,
        expected,
        got.type_name(),
        got
    ))
}

fn number_arg(name: &str, value: &Value) -> Result<f64, FormulaError> {
    value
        .as_number()
        .ok_or_else(|| type_error(name, "a number", value))
}

fn unary_math(name: &str, args: &[Value], f: fn(f64) -> f64) -> Result<Value, FormulaError> {
    arity(name, args, 1, 1)?;
    Ok(Value::Number(f(number_arg(name, &args[0])?)))
}

fn round(args: &[Value]) -> Result<Value, FormulaError> {
    arity("round", args, 1, 2)?;
    let x = number_arg("round", &args[0])?;
    let digits = match args.get(1) {
        Some(d) => number_arg("round", d)?.trunc() as i32,
        None => 0,
    };
    let factor = 10f64.powi(digits);
    Ok(Value::Number((x * factor).round() / factor))
}

fn extreme(name: &str, args: &[Value], keep: std::cmp::Ordering) -> Result<Value, FormulaError> {
    if args.is_empty() {
        return Err(FormulaError::Arity {
            function: name.to_string(),
            expected: "at least 1".to_string(),
            got: 0,
        });
    }
    let mut best: Option<&Value> = None;
    for arg in args.iter().filter(|v| !v.is_null()) {
        best = match best {
            None => Some(arg),
            Some(current) => match arg.compare(current) {
                Some(ord) if ord == keep => Some(arg),
                Some(_) => Some(current),
                None => {
                    return Err(FormulaError::Type(format!(
                        "{}() cannot compare {} with {}",
                        name,
                        arg.type_name(),
                        current.type_name()
                    )))
                }
            },
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn text_map(name: &str, args: &[Value], f: impl Fn(&str) -> String) -> Result<Value, FormulaError> {
    arity(name, args, 1, 1)?;
    Ok(match &args[0] {
        Value::Null => Value::Null,
        v => Value::Text(f(&v.display_string())),
    })
}

fn text_predicate(
    name: &str,
    args: &[Value],
    f: impl Fn(&str, &str) -> bool,
) -> Result<Value, FormulaError> {
    arity(name, args, 2, 2)?;
    if args[0].is_null() {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Bool(f(&args[0].display_string(), &args[1].display_string())))
}

/// `substring(text, start[, end])` over characters; indexes are clamped and
/// swapped when reversed.
fn substring(args: &[Value]) -> Result<Value, FormulaError> {
    arity("substring", args, 2, 3)?;
    if args[0].is_null() {
        return Ok(Value::Null);
    }
    let chars: Vec<char> = args[0].display_string().chars().collect();
    let clamp = |v: f64| -> usize {
        if v.is_nan() || v < 0.0 {
            0
        } else {
            (v as usize).min(chars.len())
        }
    };
    let start = clamp(number_arg("substring", &args[1])?);
    let end = match args.get(2) {
        Some(end) => clamp(number_arg("substring", end)?),
        None => chars.len(),
    };
    let (start, end) = if start > end { (end, start) } else { (start, end) };
    Ok(Value::Text(chars[start..end].iter().collect()))
}

fn date_part(name: &str, args: &[Value], f: fn(NaiveDate) -> f64) -> Result<Value, FormulaError> {
    arity(name, args, 1, 1)?;
    match &args[0] {
        Value::Null => Ok(Value::Null),
        v => v
            .as_date()
            .map(|d| Value::Number(f(d)))
            .ok_or_else(|| type_error(name, "a date", v)),
    }
}

fn unit_arg(name: &str, args: &[Value], index: usize) -> Result<String, FormulaError> {
    match args.get(index) {
        None => Ok("days".to_string()),
        Some(Value::Text(unit)) => Ok(unit.to_lowercase()),
        Some(other) => Err(type_error(name, "a unit name", other)),
    }
}

/// `dateAdd(date, amount[, unit])`. Day-granular units keep dates as
/// dates; hours and minutes promote to datetime.
fn date_add(args: &[Value]) -> Result<Value, FormulaError> {
    const NAME: &str = "dateAdd";
    arity(NAME, args, 2, 3)?;
    if args[0].is_null() {
        return Ok(Value::Null);
    }
    let amount = number_arg(NAME, &args[1])?.trunc() as i64;
    let unit = unit_arg(NAME, args, 2)?;
    let overflow = || FormulaError::Type(format!("{}() result out of range", NAME));

    let is_datetime = matches!(args[0], Value::DateTime(_))
        || matches!(&args[0], Value::Text(s) if s.contains('T') || s.contains(' '));

    match unit.as_str() {
        "hours" | "hour" | "minutes" | "minute" => {
            let dt = args[0]
                .as_datetime()
                .ok_or_else(|| type_error(NAME, "a date or datetime", &args[0]))?;
            let delta = if unit.starts_with("hour") {
                Duration::hours(amount)
            } else {
                Duration::minutes(amount)
            };
            dt.checked_add_signed(delta).map(Value::DateTime).ok_or_else(overflow)
        }
        "days" | "day" | "weeks" | "week" | "months" | "month" | "years" | "year" => {
            if is_datetime {
                let dt = args[0]
                    .as_datetime()
                    .ok_or_else(|| type_error(NAME, "a date or datetime", &args[0]))?;
                let naive = shift_date(dt.date_naive(), amount, &unit).ok_or_else(overflow)?;
                let shifted = naive.and_time(dt.time()).and_utc();
                Ok(Value::DateTime(shifted))
            } else {
                let date = args[0]
                    .as_date()
                    .ok_or_else(|| type_error(NAME, "a date", &args[0]))?;
                shift_date(date, amount, &unit).map(Value::Date).ok_or_else(overflow)
            }
        }
        other => Err(FormulaError::Type(format!("{}() unknown unit '{}'", NAME, other))),
    }
}

fn shift_date(date: NaiveDate, amount: i64, unit: &str) -> Option<NaiveDate> {
    let months = |n: i64| -> Option<NaiveDate> {
        let m = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
        if n >= 0 {
            date.checked_add_months(m)
        } else {
            date.checked_sub_months(m)
        }
    };
    match unit {
        "days" | "day" => date.checked_add_signed(Duration::days(amount)),
        "weeks" | "week" => date.checked_add_signed(Duration::weeks(amount)),
        "months" | "month" => months(amount),
        "years" | "year" => months(amount.checked_mul(12)?),
        _ => None,
    }
}

/// `dateDiff(start, end[, unit])` is `end - start`, truncated to whole units.
fn date_diff(args: &[Value]) -> Result<Value, FormulaError> {
    const NAME: &str = "dateDiff";
    arity(NAME, args, 2, 3)?;
    if args[0].is_null() || args[1].is_null() {
        return Ok(Value::Null);
    }
    let unit = unit_arg(NAME, args, 2)?;
    let start = args[0]
        .as_datetime()
        .ok_or_else(|| type_error(NAME, "a date", &args[0]))?;
    let end = args[1]
        .as_datetime()
        .ok_or_else(|| type_error(NAME, "a date", &args[1]))?;
    let delta = end - start;

    let value = match unit.as_str() {
        "days" | "day" => delta.num_days() as f64,
        "weeks" | "week" => delta.num_weeks() as f64,
        "hours" | "hour" => delta.num_hours() as f64,
        "minutes" | "minute" => delta.num_minutes() as f64,
        "months" | "month" | "years" | "year" => {
            let (s, e) = (start.date_naive(), end.date_naive());
            let mut months = (e.year() - s.year()) * 12 + e.month() as i32 - s.month() as i32;
            if months > 0 && e.day() < s.day() {
                months -= 1;
            } else if months < 0 && e.day() > s.day() {
                months += 1;
            }
            if unit.starts_with("year") {
                (months / 12) as f64
            } else {
                months as f64
            }
        }
        other => return Err(FormulaError::Type(format!("{}() unknown unit '{}'", NAME, other))),
    };
    Ok(Value::Number(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 0).unwrap()
    }

    fn call(name: &str, args: &[Value]) -> Result<Value, FormulaError> {
        call_builtin(name, args, now()).expect("builtin")
    }

    fn date(y: i32, m: u32, d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_math() {
        assert_eq!(call("round", &[2.346.into(), 2.0.into()]).unwrap(), Value::Number(2.35));
        assert_eq!(call("round", &[2.5.into()]).unwrap(), Value::Number(3.0));
        assert_eq!(call("abs", &[(-4.0).into()]).unwrap(), Value::Number(4.0));
        assert_eq!(call("pow", &[2.0.into(), 10.0.into()]).unwrap(), Value::Number(1024.0));
        assert_eq!(
            call("max", &[1.0.into(), Value::Null, 7.0.into(), 3.0.into()]).unwrap(),
            Value::Number(7.0)
        );
        assert_eq!(call("min", &["b".into(), "a".into()]).unwrap(), Value::Text("a".into()));
    }

    #[test]
    fn test_text() {
        assert_eq!(call("upper", &["abc".into()]).unwrap(), Value::Text("ABC".into()));
        assert_eq!(call("upper", &[Value::Null]).unwrap(), Value::Null);
        assert_eq!(call("len", &["héllo".into()]).unwrap(), Value::Number(5.0));
        assert_eq!(
            call("concat", &["a".into(), 1.0.into(), Value::Null, true.into()]).unwrap(),
            Value::Text("a1true".into())
        );
        assert_eq!(
            call("substring", &["metadata".into(), 4.0.into(), 0.0.into()]).unwrap(),
            Value::Text("meta".into())
        );
        assert_eq!(
            call("contains", &["invoice".into(), "voice".into()]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_dates() {
        assert_eq!(call("today", &[]).unwrap(), date(2024, 6, 15));
        assert_eq!(call("year", &["2023-02-01".into()]).unwrap(), Value::Number(2023.0));
        assert_eq!(
            call("dateAdd", &[date(2024, 1, 31), 1.0.into(), "months".into()]).unwrap(),
            date(2024, 2, 29)
        );
        assert_eq!(
            call("dateAdd", &["2024-01-01".into(), (-1.0).into()]).unwrap(),
            date(2023, 12, 31)
        );
        assert_eq!(
            call("dateDiff", &[date(2024, 1, 1), date(2024, 3, 1)]).unwrap(),
            Value::Number(60.0)
        );
        assert_eq!(
            call("dateDiff", &[date(2024, 1, 15), date(2024, 3, 14), "months".into()]).unwrap(),
            Value::Number(1.0)
        );
    }

    #[test]
    fn test_logic() {
        assert_eq!(
            call("coalesce", &[Value::Null, 0.0.into(), 5.0.into()]).unwrap(),
            Value::Number(0.0)
        );
        assert_eq!(call("isBlank", &["  ".into()]).unwrap(), Value::Bool(true));
        assert_eq!(call("number", &["42".into()]).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_arity_and_type_errors() {
        assert!(matches!(call("abs", &[]), Err(FormulaError::Arity { .. })));
        assert!(matches!(call("abs", &["x".into()]), Err(FormulaError::Type(_))));
        assert!(matches!(call("year", &[true.into()]), Err(FormulaError::Type(_))));
        assert!(call_builtin("launch", &[], now()).is_none());
    }
}
