//! Integration tests for document storage.

mod common;

use common::{object, ts, TestStore};
use serde_json::json;
use stow_store::{ChangeEvent, FieldValue, StoreError};

#[tokio::test]
async fn test_set_and_read_back() {
    let t = TestStore::new().await;
    let doc = object(json!({
        "name": "Ann",
        "age": 34,
        "height": 1.72,
        "active": true,
        "tags": ["admin", "ops"],
        "scores": [3, 5]
    }));
    t.store.set_value("people", "p1", &doc, None).await.unwrap();

    let read = t.store.value("people", "p1").await.unwrap().unwrap();
    assert_eq!(read.key(), "p1");
    assert_eq!(read.get("name"), Some(&FieldValue::Text("Ann".into())));
    assert_eq!(read.get("age"), Some(&FieldValue::Int(34)));
    assert_eq!(read.get("height"), Some(&FieldValue::Double(1.72)));
    assert_eq!(read.get("active"), Some(&FieldValue::Bool(true)));
    assert_eq!(
        read.get("tags"),
        Some(&FieldValue::TextArray(vec!["admin".into(), "ops".into()]))
    );
    assert_eq!(read.get("scores"), Some(&FieldValue::IntArray(vec![3, 5])));

    let stored = t.store.stored_value("people", "p1").await.unwrap().unwrap();
    assert_eq!(stored.added, Some(ts(0)));
    assert_eq!(stored.updated, Some(ts(0)));
    assert_eq!(stored.auto_delete, None);
}

#[tokio::test]
async fn test_write_is_full_replace() {
    let t = TestStore::new().await;
    let first = object(json!({"name": "Ann", "age": 34, "tags": ["a", "b"]}));
    t.store.set_value("people", "p1", &first, None).await.unwrap();

    t.advance(1_000);
    let second = object(json!({"name": "Annie"}));
    t.store.set_value("people", "p1", &second, None).await.unwrap();

    let read = t.store.value("people", "p1").await.unwrap().unwrap();
    assert_eq!(read.get("name"), Some(&FieldValue::Text("Annie".into())));
    assert_eq!(read.get("age"), None);
    assert_eq!(read.get("tags"), None);
    assert_eq!(read.len(), 1);

    let stored = t.store.stored_value("people", "p1").await.unwrap().unwrap();
    assert_eq!(stored.added, Some(ts(0)));
    assert_eq!(stored.updated, Some(ts(1_000)));
}

#[tokio::test]
async fn test_array_round_trip_is_set_equal() {
    let t = TestStore::new().await;
    let doc = object(json!({"tags": ["x", "y", "z"], "weights": [1.5, 2]}));
    t.store.set_value("items", "i1", &doc, None).await.unwrap();

    let read = t.store.value("items", "i1").await.unwrap().unwrap();
    let Some(FieldValue::TextArray(mut tags)) = read.get("tags").cloned() else {
        panic!("tags should be a text array");
    };
    tags.sort();
    assert_eq!(tags, vec!["x", "y", "z"]);
    assert_eq!(
        read.get("weights"),
        Some(&FieldValue::DoubleArray(vec![1.5, 2.0]))
    );
}

#[tokio::test]
async fn test_empty_array_is_kept() {
    let t = TestStore::new().await;
    let doc = object(json!({"tags": []}));
    t.store.set_value("items", "i1", &doc, None).await.unwrap();

    let read = t.store.value("items", "i1").await.unwrap().unwrap();
    assert_eq!(read.get("tags"), Some(&FieldValue::TextArray(vec![])));
}

#[tokio::test]
async fn test_value_json() {
    let t = TestStore::new().await;
    t.store
        .set_value_json("people", "p1", r#"{"name":"Ann","tags":["a"]}"#, None)
        .await
        .unwrap();

    let text = t.store.value_json("people", "p1").await.unwrap().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, json!({"name": "Ann", "tags": ["a"]}));

    assert_eq!(t.store.value_json("people", "nope").await.unwrap(), None);
    assert_eq!(t.store.value_json("nobody", "p1").await.unwrap(), None);
}

#[tokio::test]
async fn test_contract_violations_fail_fast() {
    let t = TestStore::new().await;
    let doc = object(json!({"name": "Ann"}));

    let err = t.store.set_value("people", "", &doc, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    let err = t.store.set_value("__secret", "p1", &doc, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    let err = t
        .store
        .set_value("people", "p1", &object(json!({"nested": {"a": 1}})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    let err = t
        .store
        .set_value_json("people", "p1", "[1, 2]", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    let err = t
        .store
        .set_value("people", "p1", &object(json!({"addedDateTime": "x"})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    assert!(!t.store.has_collection("people").await.unwrap());
}

#[tokio::test]
async fn test_type_mismatch_leaves_document_untouched() {
    let t = TestStore::new().await;
    t.store
        .set_value("people", "p1", &object(json!({"age": 34})), None)
        .await
        .unwrap();

    let err = t
        .store
        .set_value("people", "p1", &object(json!({"age": "old"})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    let read = t.store.value("people", "p1").await.unwrap().unwrap();
    assert_eq!(read.get("age"), Some(&FieldValue::Int(34)));
}

#[tokio::test]
async fn test_int_widens_into_double_column() {
    let t = TestStore::new().await;
    t.store
        .set_value("m", "a", &object(json!({"v": 1.5})), None)
        .await
        .unwrap();
    t.store
        .set_value("m", "b", &object(json!({"v": 2})), None)
        .await
        .unwrap();

    let read = t.store.value("m", "b").await.unwrap().unwrap();
    assert_eq!(read.get("v"), Some(&FieldValue::Double(2.0)));
}

#[tokio::test]
async fn test_delete_value() {
    let t = TestStore::new().await;
    let doc = object(json!({"tags": ["a"]}));
    t.store.set_value("items", "i1", &doc, None).await.unwrap();

    assert!(t.store.delete_value("items", "i1").await.unwrap());
    assert!(!t.store.delete_value("items", "i1").await.unwrap());
    assert!(!t.store.has_key("items", "i1").await.unwrap());
    assert_eq!(t.store.value("items", "i1").await.unwrap(), None);

    let rows = t
        .store
        .select_rows("select count(*) from items_arrayValues")
        .await
        .unwrap();
    assert_eq!(rows[0].int(0), Some(0));

    let err = t.store.delete_value("ghosts", "g1").await.unwrap_err();
    assert!(matches!(err, StoreError::TableNotFound(_)));
}

#[tokio::test]
async fn test_has_key_and_has_all_keys() {
    let t = TestStore::new().await;
    for key in ["a", "b", "c"] {
        t.store
            .set_value("letters", key, &object(json!({"n": 1})), None)
            .await
            .unwrap();
    }

    assert!(t.store.has_key("letters", "a").await.unwrap());
    assert!(!t.store.has_key("letters", "z").await.unwrap());
    assert!(!t.store.has_key("numbers", "a").await.unwrap());

    assert!(t.store.has_all_keys("letters", &["a", "b", "c"]).await.unwrap());
    assert!(t.store.has_all_keys("letters", &["a", "a", "b"]).await.unwrap());
    assert!(!t.store.has_all_keys("letters", &["a", "z"]).await.unwrap());
    assert!(t.store.has_all_keys("letters", &[]).await.unwrap());
    assert!(!t.store.has_all_keys("numbers", &["a"]).await.unwrap());
}

#[tokio::test]
async fn test_drop_collection() {
    let t = TestStore::new().await;
    let doc = object(json!({"tags": ["a"]}));
    t.store.set_value("items", "i1", &doc, None).await.unwrap();
    t.store.set_value("other", "o1", &doc, None).await.unwrap();
    assert_eq!(t.store.collections().await.unwrap(), vec!["items", "other"]);

    t.store.drop_collection("items").await.unwrap();
    assert_eq!(t.store.collections().await.unwrap(), vec!["other"]);
    assert!(!t.store.has_key("items", "i1").await.unwrap());

    let err = t.store.drop_collection("items").await.unwrap_err();
    assert!(matches!(err, StoreError::TableNotFound(_)));

    // Recreating starts from an empty manifest.
    t.store
        .set_value("items", "i2", &object(json!({"tags": 5})), None)
        .await
        .unwrap();
    let read = t.store.value("items", "i2").await.unwrap().unwrap();
    assert_eq!(read.get("tags"), Some(&FieldValue::Int(5)));

    t.store.drop_all_collections().await.unwrap();
    assert!(t.store.collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_delete_after_sweep() {
    let t = TestStore::new().await;
    let doc = object(json!({"name": "temp"}));
    t.store
        .set_value("cache", "soon", &doc, Some(ts(5_000)))
        .await
        .unwrap();
    t.store
        .set_value("cache", "later", &doc, Some(ts(60_000)))
        .await
        .unwrap();
    t.store.set_value("cache", "never", &doc, None).await.unwrap();

    assert_eq!(t.store.sweep_expired().await.unwrap(), 0);

    t.advance(10_000);
    let mut events = t.store.subscribe();
    assert_eq!(t.store.sweep_expired().await.unwrap(), 1);
    assert!(!t.store.has_key("cache", "soon").await.unwrap());
    assert!(t.store.has_key("cache", "later").await.unwrap());
    assert!(t.store.has_key("cache", "never").await.unwrap());

    assert_eq!(
        events.receiver.try_recv().unwrap(),
        ChangeEvent::Deleted {
            collection: "cache".into(),
            key: "soon".into(),
            expired: true
        }
    );
}

#[tokio::test]
async fn test_subscribers_see_committed_changes() {
    let t = TestStore::new().await;
    let mut sub = t.store.subscribe();

    t.store
        .set_value("people", "p1", &object(json!({"name": "Ann"})), None)
        .await
        .unwrap();
    t.store.delete_value("people", "p1").await.unwrap();
    t.store.drop_collection("people").await.unwrap();

    let events: Vec<ChangeEvent> = std::iter::from_fn(|| sub.receiver.try_recv().ok()).collect();
    assert_eq!(
        events,
        vec![
            ChangeEvent::Updated {
                collection: "people".into(),
                key: "p1".into()
            },
            ChangeEvent::Deleted {
                collection: "people".into(),
                key: "p1".into(),
                expired: false
            },
            ChangeEvent::Dropped {
                collection: "people".into()
            },
        ]
    );

    assert!(t.store.unsubscribe(&sub.id));
    t.store
        .set_value("people", "p2", &object(json!({"name": "Bo"})), None)
        .await
        .unwrap();
    assert!(sub.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_schema_survives_reopen() {
    let t = TestStore::new().await;
    t.store
        .set_value("people", "p1", &object(json!({"age": 34, "tags": ["a"]})), None)
        .await
        .unwrap();
    let key = t.store.instance_key().await.unwrap();
    let dir = t.dir;
    drop(t.store);

    let reopened = TestStore::in_dir(dir, "store.db").await;
    assert_eq!(reopened.store.instance_key().await.unwrap(), key);
    assert!(reopened.store.has_collection("people").await.unwrap());

    let err = reopened
        .store
        .set_value("people", "p2", &object(json!({"age": "x"})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));

    let read = reopened.store.value("people", "p1").await.unwrap().unwrap();
    assert_eq!(read.get("tags"), Some(&FieldValue::TextArray(vec!["a".into()])));
}

#[tokio::test]
async fn test_close_then_reopen_on_demand() {
    let t = TestStore::new().await;
    t.store
        .set_value("people", "p1", &object(json!({"name": "Ann"})), None)
        .await
        .unwrap();
    t.store.close().await.unwrap();

    assert!(t.store.has_key("people", "p1").await.unwrap());
}

#[tokio::test]
async fn test_indexes_are_created() {
    let t = TestStore::new().await;
    t.store.set_indexes("people", &["age", "last,first"]).await.unwrap();
    t.store
        .set_value(
            "people",
            "p1",
            &object(json!({"age": 34, "last": "Lee", "first": "Ann"})),
            None,
        )
        .await
        .unwrap();

    let rows = t
        .store
        .select_rows("select name from sqlite_master where type = 'index' and tbl_name = 'people' order by name")
        .await
        .unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r.text(0)).collect();
    assert!(names.contains(&"idx_people_age"));
    assert!(names.contains(&"idx_people_last_first"));

    t.store.set_indexes("people", &["age"]).await.unwrap();
    let rows = t
        .store
        .select_rows("select name from sqlite_master where type = 'index' and name = 'idx_people_last_first'")
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_damaged_file_is_reported() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("junk.db"), vec![0x5a; 4096]).unwrap();

    let err = stow_store::Store::open(common::config(&dir, "junk.db"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::DamagedFile(_) | StoreError::CannotOpenFile(_)
    ));
}

#[tokio::test]
async fn test_write_recovers_when_table_vanishes_behind_the_cache() {
    let t = TestStore::new().await;
    t.store
        .set_value("people", "p1", &object(json!({"name": "Ann", "tags": ["a"]})), None)
        .await
        .unwrap();

    common::execute_behind(&t.dir, "store.db", &["drop table people", "drop table people_arrayValues"]).await;

    // The cached schema still lists the collection; the first attempt fails
    // and the retry recreates the tables.
    t.store
        .set_value("people", "p2", &object(json!({"name": "Bo", "tags": ["b"]})), None)
        .await
        .unwrap();
    let doc = t.store.value("people", "p2").await.unwrap().unwrap();
    assert_eq!(doc.get("name"), Some(&FieldValue::Text("Bo".into())));
    assert_eq!(doc.get("tags"), Some(&FieldValue::TextArray(vec!["b".into()])));
    assert!(!t.store.has_key("people", "p1").await.unwrap());
}

#[tokio::test]
async fn test_write_recovers_when_column_vanishes_behind_the_cache() {
    let t = TestStore::new().await;
    t.store
        .set_value("people", "p1", &object(json!({"name": "Ann", "age": 34})), None)
        .await
        .unwrap();

    common::execute_behind(&t.dir, "store.db", &["alter table people drop column age"]).await;

    t.store
        .set_value("people", "p1", &object(json!({"name": "Ann", "age": 35})), None)
        .await
        .unwrap();
    let doc = t.store.value("people", "p1").await.unwrap().unwrap();
    assert_eq!(doc.get("age"), Some(&FieldValue::Int(35)));
}
