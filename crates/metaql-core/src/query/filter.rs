//! In-process filter evaluation.
//!
//! Used by the memory and sled drivers to scan records and by the
//! validation engine for `when` guards and cross-field comparisons.

use std::cmp::Ordering;

use metaql_proto::{compare_values, get_path, values_equal, Condition, Filter, FilterOperator, Record};
use serde_json::Value;

/// Whether a record satisfies a filter. An empty `And` matches everything.
pub fn matches(record: &Record, filter: &Filter) -> bool {
    match filter {
        Filter::Condition(condition) => matches_condition(record, condition),
        Filter::And(items) => items.iter().all(|f| matches(record, f)),
        Filter::Or(items) => items.iter().any(|f| matches(record, f)),
    }
}

/// Evaluate one leaf against a record. Dotted fields navigate expanded lookups.
pub fn matches_condition(record: &Record, condition: &Condition) -> bool {
    compare(get_path(record, &condition.field), condition.operator, &condition.value)
}

/// Apply an operator to a field value. A missing field behaves as null.
pub fn compare(actual: Option<&Value>, operator: FilterOperator, operand: &Value) -> bool {
    let actual = actual.unwrap_or(&Value::Null);
    match operator {
        FilterOperator::Eq => values_equal(actual, operand),
        FilterOperator::Ne => !values_equal(actual, operand),
        FilterOperator::Gt => ordering(actual, operand, |o| o == Ordering::Greater),
        FilterOperator::Gte => ordering(actual, operand, |o| o != Ordering::Less),
        FilterOperator::Lt => ordering(actual, operand, |o| o == Ordering::Less),
        FilterOperator::Lte => ordering(actual, operand, |o| o != Ordering::Greater),
        FilterOperator::In => in_list(actual, operand),
        FilterOperator::NotIn => !in_list(actual, operand),
        FilterOperator::Contains => match actual {
            Value::Array(items) => items.iter().any(|item| values_equal(item, operand)),
            _ => text_test(actual, operand, |s, p| s.contains(p)),
        },
        FilterOperator::StartsWith => text_test(actual, operand, |s, p| s.starts_with(p)),
        FilterOperator::EndsWith => text_test(actual, operand, |s, p| s.ends_with(p)),
        FilterOperator::Between => match operand.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                ordering(actual, low, |o| o != Ordering::Less)
                    && ordering(actual, high, |o| o != Ordering::Greater)
            }
            _ => false,
        },
        FilterOperator::IsNull => actual.is_null(),
        FilterOperator::IsNotNull => !actual.is_null(),
    }
}

fn ordering(actual: &Value, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    compare_values(actual, operand).map(accept).unwrap_or(false)
}

fn in_list(actual: &Value, operand: &Value) -> bool {
    operand
        .as_array()
        .map(|items| items.iter().any(|item| values_equal(actual, item)))
        .unwrap_or(false)
}

/// Case-insensitive string predicate; non-string operands never match.
fn text_test(actual: &Value, operand: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (actual.as_str(), operand.as_str()) {
        (Some(s), Some(p)) => test(&s.to_lowercase(), &p.to_lowercase()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn filter(value: Value) -> Filter {
        Filter::from_json(&value).unwrap()
    }

    #[test]
    fn test_comparisons() {
        let r = record(json!({"age": 30, "name": "Ada", "tags": ["vip"], "score": null}));
        assert!(matches(&r, &filter(json!(["age", ">=", 30]))));
        assert!(!matches(&r, &filter(json!(["age", ">", 30]))));
        assert!(matches(&r, &filter(json!(["name", "startswith", "ad"]))));
        assert!(matches(&r, &filter(json!(["tags", "contains", "vip"]))));
        assert!(matches(&r, &filter(json!(["age", "between", [18, 65]]))));
        assert!(matches(&r, &filter(json!(["age", "in", [10, 30]]))));
        assert!(matches(&r, &filter(json!(["score", "is_null", null]))));
        assert!(matches(&r, &filter(json!(["missing", "is_null", null]))));
        assert!(!matches(&r, &filter(json!(["score", ">", 0]))));
    }

    #[test]
    fn test_logic() {
        let r = record(json!({"status": "open", "priority": 1}));
        assert!(matches(
            &r,
            &filter(json!([["status", "=", "closed"], "or", ["priority", "<", 2]]))
        ));
        assert!(!matches(
            &r,
            &filter(json!([["status", "=", "open"], "and", ["priority", ">", 2]]))
        ));
        assert!(matches(&r, &Filter::And(vec![])));
    }

    #[test]
    fn test_dotted_paths() {
        let r = record(json!({"account": {"industry": "Energy"}}));
        assert!(matches(&r, &filter(json!(["account.industry", "=", "Energy"]))));
    }

    #[test]
    fn test_date_strings_compare_chronologically() {
        let r = record(json!({"start_date": "2024-12-31"}));
        assert!(compare(r.get("start_date"), FilterOperator::Gt, &json!("2024-01-01")));
    }
}
