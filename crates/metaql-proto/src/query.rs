//! Unified query IR.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    /// Field to sort by.
    pub field: String,
    /// Direction.
    #[serde(default)]
    pub order: SortDirection,
}

impl SortSpec {
    /// Ascending sort on a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortDirection::Asc,
        }
    }

    /// Descending sort on a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortDirection::Desc,
        }
    }
}

/// Options for expanding a lookup field into the referenced record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExpandSpec {
    /// Fields to project from the referenced record (`None` = all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// Additional filter on referenced records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filter>,
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    /// Count of records/values.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Average of numeric values.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

impl AggregateFunction {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// A single aggregation operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregation {
    /// The aggregation function to apply.
    pub func: AggregateFunction,
    /// Field to aggregate (`None` for `count(*)`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Output column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Aggregation {
    /// `count(*)`.
    pub fn count() -> Self {
        Self {
            func: AggregateFunction::Count,
            field: None,
            alias: None,
        }
    }

    /// Aggregate over a field.
    pub fn of(func: AggregateFunction, field: impl Into<String>) -> Self {
        Self {
            func,
            field: Some(field.into()),
            alias: None,
        }
    }

    /// Set the output column name.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name: the alias, or `func_field` / `count`.
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.field) {
            (Some(alias), _) => alias.clone(),
            (None, Some(field)) => format!("{}_{}", self.func.as_str(), field),
            (None, None) => self.func.as_str().to_string(),
        }
    }
}

/// Declarative read/aggregate description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedQuery {
    /// Target object name.
    pub object: String,
    /// Projection (`None` = all fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// Filter tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filter>,
    /// Sort keys, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortSpec>,
    /// Maximum number of records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<usize>,
    /// Records to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Lookup fields to expand into the referenced record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expand: BTreeMap<String, ExpandSpec>,
    /// Grouping keys for aggregation.
    #[serde(default, rename = "groupBy", skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    /// Aggregations to compute.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate: Vec<Aggregation>,
}

impl UnifiedQuery {
    /// Query every record of an object.
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..Default::default()
        }
    }

    /// Set the projection.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Set (or AND onto) the filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters = Some(match self.filters.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Add a sort key.
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    /// Limit the result size.
    pub fn with_top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    /// Skip leading records.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Expand a lookup field.
    pub fn with_expand(mut self, field: impl Into<String>, spec: ExpandSpec) -> Self {
        self.expand.insert(field.into(), spec);
        self
    }

    /// Add a grouping key.
    pub fn with_group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    /// Add an aggregation.
    pub fn with_aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregate.push(aggregation);
        self
    }

    /// Whether this query asks for aggregation rather than rows.
    pub fn is_aggregate(&self) -> bool {
        !self.aggregate.is_empty() || !self.group_by.is_empty()
    }
}
