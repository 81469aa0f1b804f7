//! Grouped aggregation over records.

use std::cmp::Ordering;
use std::collections::HashMap;

use metaql_proto::{compare_values, get_path, AggregateFunction, Aggregation, Record, UnifiedQuery, Value};

use super::executor::{paginate, sort_records};
use super::filter::matches;

/// Compute `query.aggregate` per `query.group_by` group.
///
/// Each output row holds the group key fields followed by one column per
/// aggregation, named by [`Aggregation::output_name`]. Groups come out in
/// first-seen order unless `query.sort` says otherwise. Without grouping
/// a single row is produced, even for no input.
pub fn aggregate_records<I>(records: I, query: &UnifiedQuery) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut groups: Vec<(Vec<Value>, Vec<Record>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        if let Some(filter) = &query.filters {
            if !matches(&record, filter) {
                continue;
            }
        }
        let key: Vec<Value> = query
            .group_by
            .iter()
            .map(|field| get_path(&record, field).cloned().unwrap_or(Value::Null))
            .collect();
        let slot = *index
            .entry(Value::Array(key.clone()).to_string())
            .or_insert_with(|| {
                groups.push((key, Vec::new()));
                groups.len() - 1
            });
        groups[slot].1.push(record);
    }

    if groups.is_empty() && query.group_by.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    let mut rows: Vec<Record> = groups
        .into_iter()
        .map(|(key, members)| {
            let mut row = Record::new();
            for (field, value) in query.group_by.iter().zip(key) {
                row.insert(field.clone(), value);
            }
            for aggregation in &query.aggregate {
                row.insert(aggregation.output_name(), compute(aggregation, &members));
            }
            row
        })
        .collect();

    sort_records(&mut rows, &query.sort);
    paginate(rows, query.skip, query.top)
}

fn compute(aggregation: &Aggregation, rows: &[Record]) -> Value {
    let Some(field) = aggregation.field.as_deref() else {
        return match aggregation.func {
            AggregateFunction::Count => Value::from(rows.len()),
            _ => Value::Null,
        };
    };

    let values = rows
        .iter()
        .filter_map(|r| get_path(r, field))
        .filter(|v| !v.is_null());

    match aggregation.func {
        AggregateFunction::Count => Value::from(values.count()),
        AggregateFunction::Sum => number(values.filter_map(Value::as_f64).sum()),
        AggregateFunction::Avg => {
            let numbers: Vec<f64> = values.filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFunction::Min => extreme(values, Ordering::Less),
        AggregateFunction::Max => extreme(values, Ordering::Greater),
    }
}

fn extreme<'a>(values: impl Iterator<Item = &'a Value>, wanted: Ordering) -> Value {
    values
        .fold(None::<&Value>, |best, v| match best {
            Some(b) if compare_values(v, b) != Some(wanted) => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Value::Null)
}

/// Integral results are rendered as integers.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
