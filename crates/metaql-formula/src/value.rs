//! Runtime values and coercions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value as Json;

/// A value produced while evaluating a formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Convert a record value.
    ///
    /// Strings stay text; date-shaped strings only become dates where an
    /// operation asks for one (see [`Value::as_date`]).
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON. Non-finite numbers become null.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_json(*n),
            Value::Text(s) => Json::String(s.clone()),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => Json::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness: null, false, 0, NaN and the empty string are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) => !s.is_empty(),
            Value::Date(_) | Value::DateTime(_) | Value::List(_) | Value::Object(_) => true,
        }
    }

    /// Numeric view used by arithmetic. Null counts as zero.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Some(*n),
            Value::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Some(0.0)
                } else {
                    trimmed.parse::<f64>().ok()
                }
            }
            _ => None,
        }
    }

    /// Date view: dates, datetimes (date part) and ISO-8601 text.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date_naive()),
            Value::Text(s) => parse_date(s),
            _ => None,
        }
    }

    /// Datetime view; a bare date is midnight UTC.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            Value::Date(d) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()),
            Value::Text(s) => parse_datetime(s).or_else(|| {
                parse_date(s)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|n| n.and_utc())
            }),
            _ => None,
        }
    }

    /// Text rendering used by concatenation and `text()`.
    pub fn display_string(&self) -> String {
        self.to_string()
    }

    /// Loose equality (`==`): numbers and numeric text compare numerically,
    /// dates compare with ISO text, null equals only null.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Number(_), Value::Text(_))
            | (Value::Text(_), Value::Number(_))
            | (Value::Bool(_), Value::Number(_))
            | (Value::Number(_), Value::Bool(_)) => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (Value::Date(_), _) | (_, Value::Date(_)) => {
                matches!((self.as_date(), other.as_date()), (Some(a), Some(b)) if a == b)
            }
            (Value::DateTime(_), _) | (_, Value::DateTime(_)) => {
                matches!((self.as_datetime(), other.as_datetime()), (Some(a), Some(b)) if a == b)
            }
            _ => self.strict_eq(other),
        }
    }

    /// Strict equality (`===`): same type and value.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            _ => self == other,
        }
    }

    /// Ordering for `< <= > >=`, `min`, `max`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Date(_), _) | (_, Value::Date(_)) => self.as_date()?.partial_cmp(&other.as_date()?),
            (Value::DateTime(_), _) | (_, Value::DateTime(_)) => {
                self.as_datetime()?.partial_cmp(&other.as_datetime()?)
            }
            (Value::List(_), _) | (_, Value::List(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => None,
            _ => self.as_number()?.partial_cmp(&other.as_number()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
            Value::Object(_) => write!(f, "[object]"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Render a number the way users expect: integers without a fraction.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Integral numbers become JSON integers.
pub(crate) fn number_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Json::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    parse_datetime(s).map(|dt| dt.date_naive())
}

pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let value = Value::from_json(&json!({"qty": 3, "tags": ["a"], "note": null}));
        match &value {
            Value::Object(map) => {
                assert_eq!(map["qty"], Value::Number(3.0));
                assert_eq!(map["tags"], Value::List(vec![Value::Text("a".into())]));
                assert_eq!(map["note"], Value::Null);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(Value::Number(f64::NAN).to_json(), Json::Null);
        assert!(Value::Number(255.0).to_json().is_i64());
        assert_eq!(Value::Number(2.5).to_json(), json!(2.5));
        assert_eq!(
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()).to_json(),
            json!("2024-03-09")
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Text(String::new()).truthy());
        assert!(Value::Text("0".into()).truthy());
        assert!(Value::List(vec![]).truthy());
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(Value::Null.as_number(), Some(0.0));
        assert_eq!(Value::Text(" 12.5 ".into()).as_number(), Some(12.5));
        assert_eq!(Value::Text("abc".into()).as_number(), None);
        assert_eq!(Value::Bool(true).as_number(), Some(1.0));
    }

    #[test]
    fn test_equality() {
        assert!(Value::Number(5.0).loose_eq(&Value::Text("5".into())));
        assert!(!Value::Number(5.0).strict_eq(&Value::Text("5".into())));
        assert!(!Value::Null.loose_eq(&Value::Number(0.0)));
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert!(date.loose_eq(&Value::Text("2024-01-02".into())));
    }

    #[test]
    fn test_compare_dates_with_text() {
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(date.compare(&Value::Text("2024-02-01".into())), Some(Ordering::Less));
        assert_eq!(Value::Number(2.0).compare(&Value::Text("x".into())), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_parse_datetime_forms() {
        assert!(parse_datetime("2024-05-01T10:00:00Z").is_some());
        assert!(parse_datetime("2024-05-01 10:00:00").is_some());
        assert_eq!(
            parse_date("2024-05-01T23:00:00Z"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
    }
}
