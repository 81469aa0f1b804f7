//! Comparison semantics for JSON values.
//!
//! Filters and validation rules both compare literal values against record
//! fields; they share these helpers so a predicate means the same thing in a
//! query and in a rule.

use std::cmp::Ordering;

use serde_json::Value;

/// Compare two values.
///
/// Numbers compare numerically, numeric strings are coerced when compared
/// with numbers, strings compare lexicographically (ISO-8601 dates therefore
/// order chronologically), booleans compare `false < true`. Null and
/// mismatched types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Number(x), Value::String(s)) => x.as_f64()?.partial_cmp(&s.trim().parse::<f64>().ok()?),
        (Value::String(s), Value::Number(y)) => s.trim().parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Equality with the same coercions as [`compare_values`].
///
/// Unlike ordering, `null == null` holds.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(_), Value::Object(_)) => a == b,
        _ => compare_values(a, b) == Some(Ordering::Equal),
    }
}

/// A value counts as blank when it is null, an empty/whitespace string or
/// an empty array.
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(compare_values(&json!(1), &json!(2.5)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("10"), &json!(9)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("abc"), &json!(9)), None);
    }

    #[test]
    fn test_iso_dates_order_chronologically() {
        assert_eq!(
            compare_values(&json!("2024-12-31"), &json!("2024-01-01")),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_null_semantics() {
        assert_eq!(compare_values(&Value::Null, &json!(1)), None);
        assert!(values_equal(&Value::Null, &Value::Null));
        assert!(!values_equal(&Value::Null, &json!(0)));
    }

    #[test]
    fn test_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&json!("  "))));
        assert!(is_blank(Some(&json!([]))));
        assert!(!is_blank(Some(&json!(0))));
        assert!(!is_blank(Some(&json!(false))));
    }
}
