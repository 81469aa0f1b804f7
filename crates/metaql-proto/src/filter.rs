//! Filter AST.
//!
//! Filters travel as JSON in one of two shapes:
//!
//! - array form: `[["status", "=", "open"], "or", [["a", ">", 1], "and", ["b", "<", 2]]]`
//! - object-keyed form: `{"status": "open", "budget": {"$gt": 1000}, "$or": [...]}`
//!
//! Both parse into the same [`Filter`] tree. Serialization always emits the
//! array form. In a flat array group `and` binds tighter than `or`, and two
//! adjacent operands without a token between them are joined with `and`.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::Error;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterOperator {
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Value is one of a list.
    In,
    /// Value is not in a list.
    NotIn,
    /// String contains substring (case-insensitive).
    Contains,
    /// String starts with prefix (case-insensitive).
    StartsWith,
    /// String ends with suffix (case-insensitive).
    EndsWith,
    /// Inclusive range `[low, high]`.
    Between,
    /// Field is null or absent. The value operand is ignored.
    IsNull,
    /// Field is present and not null. The value operand is ignored.
    IsNotNull,
}

impl FilterOperator {
    /// Parse an operator token, accepting common aliases.
    pub fn parse(token: &str) -> Result<Self, Error> {
        let op = match token.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => FilterOperator::Eq,
            "!=" | "<>" | "ne" => FilterOperator::Ne,
            ">" | "gt" => FilterOperator::Gt,
            ">=" | "gte" => FilterOperator::Gte,
            "<" | "lt" => FilterOperator::Lt,
            "<=" | "lte" => FilterOperator::Lte,
            "in" => FilterOperator::In,
            "nin" | "not in" | "notin" => FilterOperator::NotIn,
            "contains" | "like" => FilterOperator::Contains,
            "startswith" => FilterOperator::StartsWith,
            "endswith" => FilterOperator::EndsWith,
            "between" => FilterOperator::Between,
            "is_null" | "isnull" => FilterOperator::IsNull,
            "is_not_null" | "isnotnull" => FilterOperator::IsNotNull,
            _ => return Err(Error::UnknownOperator(token.to_string())),
        };
        Ok(op)
    }

    /// Parse a `$`-prefixed operator key of the object-keyed form.
    fn parse_dollar(key: &str) -> Result<Self, Error> {
        let op = match key {
            "$eq" => FilterOperator::Eq,
            "$ne" => FilterOperator::Ne,
            "$gt" => FilterOperator::Gt,
            "$gte" => FilterOperator::Gte,
            "$lt" => FilterOperator::Lt,
            "$lte" => FilterOperator::Lte,
            "$in" => FilterOperator::In,
            "$nin" => FilterOperator::NotIn,
            "$contains" => FilterOperator::Contains,
            "$startsWith" => FilterOperator::StartsWith,
            "$endsWith" => FilterOperator::EndsWith,
            "$between" => FilterOperator::Between,
            "$null" => FilterOperator::IsNull,
            _ => return Err(Error::UnknownOperator(key.to_string())),
        };
        Ok(op)
    }

    /// Canonical token used when serializing.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Ne => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "nin",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "startswith",
            FilterOperator::EndsWith => "endswith",
            FilterOperator::Between => "between",
            FilterOperator::IsNull => "is_null",
            FilterOperator::IsNotNull => "is_not_null",
        }
    }

    /// Whether an index on the field can serve this predicate.
    pub fn is_index_friendly(&self) -> bool {
        matches!(
            self,
            FilterOperator::Eq
                | FilterOperator::Gt
                | FilterOperator::Gte
                | FilterOperator::Lt
                | FilterOperator::Lte
                | FilterOperator::In
                | FilterOperator::Between
                | FilterOperator::StartsWith
        )
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `[field, operator, value]` leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Field name, possibly a dotted lookup path.
    pub field: String,
    /// Comparison operator.
    pub operator: FilterOperator,
    /// Literal operand.
    pub value: Value,
}

impl Condition {
    /// Create a condition, checking the operand shape for list/range operators.
    pub fn new(
        field: impl Into<String>,
        operator: FilterOperator,
        value: Value,
    ) -> Result<Self, Error> {
        match operator {
            FilterOperator::In | FilterOperator::NotIn if !value.is_array() => {
                return Err(Error::InvalidOperand {
                    operator: operator.to_string(),
                    message: "expected an array".into(),
                });
            }
            FilterOperator::Between
                if value.as_array().map(|a| a.len() != 2).unwrap_or(true) =>
            {
                return Err(Error::InvalidOperand {
                    operator: operator.to_string(),
                    message: "expected a [low, high] pair".into(),
                });
            }
            _ => {}
        }
        Ok(Self {
            field: field.into(),
            operator,
            value,
        })
    }
}

/// Recursive filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// A single leaf predicate.
    Condition(Condition),
    /// All children must match.
    And(Vec<Filter>),
    /// At least one child must match.
    Or(Vec<Filter>),
}

impl Filter {
    /// Build a leaf without operand checking (for operators that accept any value).
    pub fn condition(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Filter::Condition(Condition {
            field: field.into(),
            operator,
            value: value.into(),
        })
    }

    /// `field = value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOperator::Eq, value)
    }

    /// `field != value`.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOperator::Ne, value)
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOperator::Gt, value)
    }

    /// `field >= value`.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOperator::Gte, value)
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOperator::Lt, value)
    }

    /// `field <= value`.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOperator::Lte, value)
    }

    /// `field in [values]`.
    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(field, FilterOperator::In, Value::Array(values))
    }

    /// Combine with another filter using AND, flattening nested ANDs.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), right) => {
                left.push(right);
                Filter::And(left)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }

    /// Combine with another filter using OR.
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut items) => {
                items.push(other);
                Filter::Or(items)
            }
            left => Filter::Or(vec![left, other]),
        }
    }

    /// Every field path referenced by a leaf.
    pub fn fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        self.for_each_condition(&mut |c| {
            fields.insert(c.field.clone());
        });
        fields
    }

    /// Visit every leaf in depth-first order.
    pub fn for_each_condition<F: FnMut(&Condition)>(&self, visit: &mut F) {
        match self {
            Filter::Condition(c) => visit(c),
            Filter::And(items) | Filter::Or(items) => {
                for item in items {
                    item.for_each_condition(visit);
                }
            }
        }
    }

    /// Parse either JSON shape.
    pub fn from_json(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Array(items) => parse_array(items),
            Value::Object(map) => parse_object(map),
            other => Err(Error::InvalidFilter(other.to_string())),
        }
    }

    /// Render to the canonical array form.
    pub fn to_json(&self) -> Value {
        match self {
            Filter::Condition(c) => Value::Array(vec![
                Value::String(c.field.clone()),
                Value::String(c.operator.as_str().to_string()),
                c.value.clone(),
            ]),
            Filter::And(items) => join_group(items, "and"),
            Filter::Or(items) => join_group(items, "or"),
        }
    }
}

fn join_group(items: &[Filter], token: &str) -> Value {
    let mut out = Vec::with_capacity(items.len() * 2);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(Value::String(token.to_string()));
        }
        out.push(item.to_json());
    }
    Value::Array(out)
}

fn logic_token(value: &Value) -> Option<&'static str> {
    match value.as_str()?.to_ascii_lowercase().as_str() {
        "and" => Some("and"),
        "or" => Some("or"),
        _ => None,
    }
}

fn is_leaf(items: &[Value]) -> bool {
    items.len() == 3
        && items[0].is_string()
        && logic_token(&items[0]).is_none()
        && items[1].as_str().map(|op| FilterOperator::parse(op).is_ok()).unwrap_or(false)
}

fn parse_array(items: &[Value]) -> Result<Filter, Error> {
    if is_leaf(items) {
        let field = items[0].as_str().unwrap_or_default();
        let op = FilterOperator::parse(items[1].as_str().unwrap_or_default())?;
        return Ok(Filter::Condition(Condition::new(field, op, items[2].clone())?));
    }
    if items.first().map(Value::is_string).unwrap_or(false) && logic_token(&items[0]).is_none() {
        return Err(Error::MalformedCondition(Value::Array(items.to_vec()).to_string()));
    }

    // Split into OR-separated runs of AND-joined operands.
    let mut or_runs: Vec<Vec<Filter>> = vec![Vec::new()];
    let mut expect_operand = true;
    let mut pending_token: Option<&str> = None;
    for item in items {
        if let Some(token) = logic_token(item) {
            if expect_operand {
                return Err(Error::MisplacedLogicToken(token.to_string()));
            }
            pending_token = Some(token);
            expect_operand = true;
            continue;
        }
        let operand = Filter::from_json(item)?;
        if pending_token == Some("or") {
            or_runs.push(Vec::new());
        }
        pending_token = None;
        expect_operand = false;
        if let Some(run) = or_runs.last_mut() {
            run.push(operand);
        }
    }
    if let Some(token) = pending_token {
        return Err(Error::MisplacedLogicToken(token.to_string()));
    }

    let mut groups: Vec<Filter> = or_runs
        .into_iter()
        .filter(|run| !run.is_empty())
        .map(|mut run| {
            if run.len() == 1 {
                run.remove(0)
            } else {
                Filter::And(run)
            }
        })
        .collect();

    match groups.len() {
        0 => Ok(Filter::And(Vec::new())),
        1 => Ok(groups.remove(0)),
        _ => Ok(Filter::Or(groups)),
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Filter, Error> {
    let mut parts = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "$and" | "$or" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidFilter(format!("{key} expects an array")))?;
                let children = items
                    .iter()
                    .map(Filter::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                parts.push(if key == "$and" {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                });
            }
            field => match value {
                Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
                    for (op_key, operand) in ops {
                        let mut op = FilterOperator::parse_dollar(op_key)?;
                        if op == FilterOperator::IsNull && operand == &Value::Bool(false) {
                            op = FilterOperator::IsNotNull;
                        }
                        parts.push(Filter::Condition(Condition::new(field, op, operand.clone())?));
                    }
                }
                literal => parts.push(Filter::eq(field, literal.clone())),
            },
        }
    }
    Ok(if parts.len() == 1 {
        parts.remove(0)
    } else {
        Filter::And(parts)
    })
}

impl Serialize for FilterOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FilterOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        FilterOperator::parse(&token).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_json(&value).map_err(serde::de::Error::custom)
    }
}
