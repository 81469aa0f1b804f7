//! Statically extracted dependencies match what evaluation actually reads.

use std::cell::RefCell;
use std::collections::BTreeSet;

use metaql_formula::{FieldSource, FormulaContext, FormulaEngine, FormulaType};
use serde_json::{json, Value};

/// Record wrapper that remembers every field the interpreter asks for.
struct Instrumented {
    record: Value,
    reads: RefCell<BTreeSet<String>>,
}

impl Instrumented {
    fn new(record: Value) -> Self {
        Self {
            record,
            reads: RefCell::new(BTreeSet::new()),
        }
    }
}

impl FieldSource for Instrumented {
    fn field(&self, name: &str) -> Option<Value> {
        self.reads.borrow_mut().insert(name.to_string());
        self.record.get(name).cloned()
    }
}

fn assert_roundtrip(source: &str, record: Value) {
    let engine = FormulaEngine::new();
    let meta = engine
        .extract_metadata("f", source, FormulaType::Text)
        .unwrap();

    let instrumented = Instrumented::new(record);
    let ctx = FormulaContext::new(&instrumented);
    engine.evaluate(source, &ctx, FormulaType::Text).unwrap();

    assert_eq!(
        meta.dependencies,
        *instrumented.reads.borrow(),
        "dependencies of `{}`",
        source
    );
}

#[test]
fn test_arithmetic_roundtrip() {
    assert_roundtrip(
        "quantity * unit_price - discount",
        json!({"quantity": 2, "unit_price": 3, "discount": 1}),
    );
}

#[test]
fn test_functions_and_lookups_roundtrip() {
    assert_roundtrip(
        "upper(account.owner.name) + ' ' + text(round(score, 1)) + concat(a, b)",
        json!({"account": {"owner": {"name": "x"}}, "score": 1.25, "a": "p", "b": null}),
    );
}

#[test]
fn test_operands_of_every_operator_roundtrip() {
    assert_roundtrip(
        "(a ?? b) + (c > d) + (e == f) + -g + !h",
        json!({"a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 5, "g": 1, "h": false}),
    );
}

#[test]
fn test_system_variables_read_no_fields() {
    assert_roundtrip("$today + ' ' + $is_new", json!({}));
}

#[test]
fn test_short_circuit_hides_dependency() {
    let engine = FormulaEngine::new();
    let source = "flag ? a : b";
    let meta = engine.extract_metadata("f", source, FormulaType::Number).unwrap();
    assert_eq!(meta.dependencies.len(), 3);

    let instrumented = Instrumented::new(json!({"flag": true, "a": 1, "b": 2}));
    let ctx = FormulaContext::new(&instrumented);
    engine.evaluate(source, &ctx, FormulaType::Number).unwrap();
    assert!(instrumented.reads.borrow().is_subset(&meta.dependencies));
}
