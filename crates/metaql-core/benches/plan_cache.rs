//! Plan cache benchmarks.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use metaql_core::catalog::{FieldDefinition, MetadataRegistry, ObjectDefinition};
use metaql_core::driver::DriverKind;
use metaql_core::proto::{Filter, SortSpec, UnifiedQuery, Value};
use metaql_core::query::{QueryCompiler, QueryFingerprint};

fn registry() -> Arc<MetadataRegistry> {
    let registry = Arc::new(MetadataRegistry::new());
    registry
        .register_object(
            ObjectDefinition::new("account").with_field("name", FieldDefinition::text().indexed()),
            None,
        )
        .unwrap();
    registry
        .register_object(
            ObjectDefinition::new("contact")
                .with_field("name", FieldDefinition::text())
                .with_field("age", FieldDefinition::number())
                .with_field("status", FieldDefinition::text())
                .with_field("account", FieldDefinition::lookup("account")),
            None,
        )
        .unwrap();
    registry
}

fn query(age: i64) -> UnifiedQuery {
    UnifiedQuery::new("contact")
        .with_fields(["id", "name", "account"])
        .with_filter(Filter::gt("age", age).and(Filter::eq("status", "active")))
        .with_sort(SortSpec::asc("name"))
        .with_expand("account", Default::default())
        .with_top(20)
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_cache/fingerprint");

    group.bench_function("simple_query", |b| {
        let query = UnifiedQuery::new("contact");
        b.iter(|| black_box(QueryFingerprint::from_query(&query, DriverKind::Memory)));
    });

    group.bench_function("complex_query", |b| {
        let query = query(30);
        b.iter(|| black_box(QueryFingerprint::from_query(&query, DriverKind::Memory)));
    });

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_cache/compile");

    group.bench_function("hit", |b| {
        let compiler = QueryCompiler::new(registry(), 1000);
        let mut age = 0;
        b.iter(|| {
            age += 1;
            black_box(compiler.compile(&query(age), DriverKind::Memory).unwrap());
        });
    });

    group.bench_function("miss", |b| {
        let compiler = QueryCompiler::new(registry(), 1000);
        b.iter(|| {
            compiler.clear_cache();
            black_box(compiler.compile(&query(30), DriverKind::Memory).unwrap());
        });
    });

    for capacity in [16, 256] {
        group.bench_with_input(BenchmarkId::new("churn", capacity), &capacity, |b, &capacity| {
            let compiler = QueryCompiler::new(registry(), capacity);
            // `in` list length is part of the shape, so each query misses once per pass.
            let shapes: Vec<UnifiedQuery> = (0..capacity * 2)
                .map(|i| UnifiedQuery::new("contact").with_filter(Filter::in_values("age", vec![Value::from(0); i + 1])))
                .collect();
            let mut next = 0;
            b.iter(|| {
                next = (next + 1) % shapes.len();
                black_box(compiler.compile(&shapes[next], DriverKind::Memory).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_compile);
criterion_main!(benches);
