//! Records and path helpers.

use serde_json::{Map, Value};

/// A single row/document: field name to JSON value.
pub type Record = Map<String, Value>;

/// Get the identifier of a record as a string.
///
/// Numeric ids are rendered in decimal so both document and relational
/// backends produce the same key shape.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve a dotted path (`account.owner.name`) against a record.
///
/// Each intermediate segment must be a nested object (an expanded lookup).
pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Overlay `overlay` on top of `base`, returning a new record.
pub fn merge_records(base: &Record, overlay: &Record) -> Record {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
