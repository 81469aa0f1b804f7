//! In-process execution of a query over a set of records.
//!
//! Drivers without a native query language (memory, sled) scan their rows
//! and hand them to [`run_query`].

use std::cmp::Ordering;

use metaql_proto::{compare_values, get_path, Record, SortDirection, SortSpec, UnifiedQuery, Value};

use super::filter::matches;

/// Filter, sort, page and project `records`.
pub fn run_query<I>(records: I, query: &UnifiedQuery) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut rows: Vec<Record> = match &query.filters {
        Some(filter) => records.into_iter().filter(|r| matches(r, filter)).collect(),
        None => records.into_iter().collect(),
    };

    sort_records(&mut rows, &query.sort);
    let rows = paginate(rows, query.skip, query.top);

    match &query.fields {
        Some(fields) => rows.into_iter().map(|r| project(r, fields)).collect(),
        None => rows,
    }
}

/// Stable multi-key sort. Nulls and missing values sort first ascending.
pub fn sort_records(rows: &mut [Record], sort: &[SortSpec]) {
    if sort.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for key in sort {
            let ordering = sort_cmp(get_path(a, &key.field), get_path(b, &key.field));
            let ordering = match key.order {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Total order used for sorting.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| type_rank(x).cmp(&type_rank(y))),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn paginate(rows: Vec<Record>, skip: Option<usize>, top: Option<usize>) -> Vec<Record> {
    let skip = skip.unwrap_or(0);
    match top {
        Some(top) => rows.into_iter().skip(skip).take(top).collect(),
        None => rows.into_iter().skip(skip).collect(),
    }
}

/// Keep only `fields`; the `id` is always kept.
pub fn project(mut record: Record, fields: &[String]) -> Record {
    record.retain(|key, _| key == "id" || fields.iter().any(|f| f == key));
    record
}
