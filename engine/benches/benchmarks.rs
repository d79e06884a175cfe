//! Performance benchmarks for stow-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use stow_engine::{
    ArrayManifest, Collection, CollectionSchema, Condition, Document, FieldType, KeyQuery,
    Operator, SyncFile,
};

fn create_test_schema() -> CollectionSchema {
    let mut arrays = ArrayManifest::new();
    arrays.insert("tags", FieldType::TextArray);
    CollectionSchema::new()
        .with_column("name", FieldType::Text)
        .with_column("email", FieldType::Text)
        .with_column("age", FieldType::Int)
        .with_arrays(arrays)
}

fn bench_document_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_encoding");

    let value = json!({
        "name": "Test User",
        "email": "test@example.com",
        "age": 42,
        "tags": ["a", "b", "c", "d"],
    });

    group.bench_function("from_json", |b| {
        b.iter(|| Document::from_json(black_box("user_1"), black_box(&value)))
    });

    let schema = create_test_schema();
    group.bench_function("conform", |b| {
        b.iter(|| {
            let mut doc = Document::from_json("user_1", &value).unwrap();
            schema.conform(black_box(&mut doc))
        })
    });

    group.finish();
}

fn bench_query_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_compile");
    let collection = Collection::new("users").unwrap();
    let schema = create_test_schema();

    for sets in [1u32, 10, 100] {
        let query = KeyQuery::new()
            .conditions((0..sets).flat_map(|set| {
                [
                    Condition::new(set, "age", Operator::Greater, set as i64),
                    Condition::new(set, "tags", Operator::Contains, "b"),
                ]
            }))
            .sort_by("age desc");
        group.bench_with_input(BenchmarkId::new("sets", sets), &query, |b, query| {
            b.iter(|| query.compile(black_box(&collection), black_box(&schema)))
        });
    }

    group.finish();
}

fn bench_sync_file_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_file");

    for count in [10usize, 1000] {
        let entries: Vec<_> = (0..count)
            .map(|i| {
                json!({
                    "timeStamp": "2024-02-01T00:00:00.000+00:00",
                    "tableName": "users",
                    "activity": "U",
                    "key": format!("user_{}", i),
                    "value": {"name": "Test User", "age": i},
                })
            })
            .collect();
        let text = json!({"sourceDB": "AAAA00000001", "lastSequence": count, "logEntries": entries})
            .to_string();
        group.bench_with_input(BenchmarkId::new("parse", count), &text, |b, text| {
            b.iter(|| SyncFile::from_json(black_box(text)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_document_encoding,
    bench_query_compile,
    bench_sync_file_parse
);
criterion_main!(benches);
