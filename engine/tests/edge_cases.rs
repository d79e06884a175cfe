//! Edge case tests for stow-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use proptest::prelude::*;
use serde_json::{json, Value};
use stow_engine::{
    ArrayManifest, Collection, CollectionSchema, CompiledQuery, Condition, Document, Error,
    FieldType, FieldValue, KeyQuery, Operator, SyncFile, Timestamp,
};

fn compile(query: &KeyQuery, schema: &CollectionSchema) -> String {
    let collection = Collection::new("items").unwrap();
    match query.compile(&collection, schema).unwrap() {
        CompiledQuery::Sql(sql) => sql,
        CompiledQuery::NoMatch => String::new(),
    }
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let doc = Document::from_json("k", &json!({"name": ""})).unwrap();
    assert_eq!(doc.get("name"), Some(&FieldValue::Text(String::new())));
}

#[test]
fn unicode_strings_survive_encoding() {
    let names = ["日本語テスト", "Привет мир", "🎉🚀", "Hello\nWorld\tTab"];
    for name in names {
        let doc = Document::from_json("k", &json!({ "name": name })).unwrap();
        assert_eq!(Value::Object(doc.to_json()), json!({ "name": name }));
    }
}

#[test]
fn quotes_in_condition_values_are_escaped() {
    let schema = CollectionSchema::new().with_column("name", FieldType::Text);
    let query = KeyQuery::new().filter("name", Operator::Equal, "'; drop table items; --");
    let sql = compile(&query, &schema);
    assert!(sql.contains("'''; drop table items; --'"));
}

#[test]
fn unicode_keys_are_allowed() {
    let doc = Document::from_json("ключ-🔑", &json!({"a": 1})).unwrap();
    assert_eq!(doc.key(), "ключ-🔑");
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_extremes() {
    let doc = Document::from_json("k", &json!({"min": i64::MIN, "max": i64::MAX})).unwrap();
    assert_eq!(doc.get("min"), Some(&FieldValue::Int(i64::MIN)));
    assert_eq!(doc.get("max"), Some(&FieldValue::Int(i64::MAX)));
}

#[test]
fn unsigned_beyond_i64_becomes_double() {
    let doc = Document::from_json("k", &json!({"big": u64::MAX})).unwrap();
    assert!(matches!(doc.get("big"), Some(FieldValue::Double(_))));
}

#[test]
fn negative_numbers_in_conditions() {
    let schema = CollectionSchema::new().with_column("delta", FieldType::Int);
    let query = KeyQuery::new().filter("delta", Operator::Less, -5);
    assert!(compile(&query, &schema).contains("\"delta\" < -5"));
}

// ============================================================================
// Schema Edge Cases
// ============================================================================

#[test]
fn array_field_cannot_become_scalar() {
    let mut manifest = ArrayManifest::new();
    manifest.insert("tags", FieldType::TextArray);
    let schema = CollectionSchema::new().with_arrays(manifest);
    let mut doc = Document::from_json("k", &json!({"tags": "one"})).unwrap();
    assert!(matches!(
        schema.conform(&mut doc),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn scalar_field_cannot_become_array() {
    let schema = CollectionSchema::new().with_column("tags", FieldType::Text);
    let mut doc = Document::from_json("k", &json!({"tags": ["one"]})).unwrap();
    assert!(schema.conform(&mut doc).is_err());
}

#[test]
fn double_array_accepts_int_elements() {
    let mut manifest = ArrayManifest::new();
    manifest.insert("weights", FieldType::DoubleArray);
    let schema = CollectionSchema::new().with_arrays(manifest);
    let mut doc = Document::from_json("k", &json!({"weights": [1, 2]})).unwrap();
    assert!(schema.conform(&mut doc).unwrap().is_empty());
    assert_eq!(
        doc.get("weights"),
        Some(&FieldValue::DoubleArray(vec![1.0, 2.0]))
    );
}

#[test]
fn reserved_collection_names() {
    for name in ["", "__synclog", "__settings", "sqlite_master", "a_arrayValues", "a-b"] {
        assert!(Collection::new(name).is_err(), "{name} should be rejected");
    }
}

// ============================================================================
// Query Edge Cases
// ============================================================================

#[test]
fn many_sets_render_in_set_order() {
    let schema = CollectionSchema::new().with_column("n", FieldType::Int);
    let query = KeyQuery::new()
        .condition(Condition::new(7, "n", Operator::Equal, 7))
        .condition(Condition::new(2, "n", Operator::Equal, 2))
        .condition(Condition::new(4, "n", Operator::Equal, 4));
    let sql = compile(&query, &schema);
    let two = sql.find("= 2").unwrap();
    let four = sql.find("= 4").unwrap();
    let seven = sql.find("= 7").unwrap();
    assert!(two < four && four < seven);
    assert_eq!(sql.matches("\nor ").count(), 2);
}

#[test]
fn blank_sort_is_ignored() {
    let schema = CollectionSchema::new();
    let sql = compile(&KeyQuery::new().sort_by("  "), &schema);
    assert!(!sql.contains("order by"));
}

#[test]
fn validation_with_no_conditions_matches_everything() {
    let schema = CollectionSchema::new();
    let sql = compile(&KeyQuery::new().validated(), &schema);
    assert_eq!(sql, "select \"key\" from \"items\"");
}

// ============================================================================
// Sync File Edge Cases
// ============================================================================

#[test]
fn empty_sync_file() {
    let file = SyncFile::from_json(r#"{"sourceDB": "A1", "lastSequence": 0}"#).unwrap();
    assert!(file.is_empty());
}

#[test]
fn sync_file_with_bad_timestamp_is_rejected() {
    let text = r#"{"sourceDB": "A1", "lastSequence": 1, "logEntries": [
        {"timeStamp": "2024-13-45", "tableName": "items", "activity": "X"}]}"#;
    assert!(SyncFile::from_json(text).is_err());
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn canonical_timestamps_sort_like_instants(a in 0i64..4_102_444_800_000, b in 0i64..4_102_444_800_000) {
        let ta = Timestamp::from_millis(a).unwrap();
        let tb = Timestamp::from_millis(b).unwrap();
        prop_assert_eq!(ta.cmp(&tb), ta.to_canonical().cmp(&tb.to_canonical()));
        prop_assert_eq!(Timestamp::parse(&ta.to_canonical()).unwrap(), ta);
    }

    #[test]
    fn text_literals_never_break_out(text in ".*") {
        let schema = CollectionSchema::new().with_column("name", FieldType::Text);
        let query = KeyQuery::new().filter("name", Operator::Equal, text.as_str());
        let sql = compile(&query, &schema);
        // Every quote in the value is doubled, so the quote count stays even.
        prop_assert_eq!(sql.matches('\'').count() % 2, 0);
    }

    #[test]
    fn int_arrays_encode_as_int_arrays(items in proptest::collection::vec(any::<i64>(), 1..20)) {
        let doc = Document::from_json("k", &json!({ "xs": items.clone() })).unwrap();
        prop_assert_eq!(doc.get("xs"), Some(&FieldValue::IntArray(items)));
    }
}
