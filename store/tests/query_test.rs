//! Integration tests for key queries.

mod common;

use common::{object, TestStore};
use serde_json::json;
use stow_store::{Condition, KeyQuery, Operator, StoreError};

async fn people() -> TestStore {
    let t = TestStore::new().await;
    let rows = [
        ("p1", json!({"name": "Ann", "age": 34, "city": "Oslo", "tags": ["admin", "ops"], "scores": [10, 20]})),
        ("p2", json!({"name": "Bo", "age": 27, "city": "Rome", "tags": ["ops"], "scores": [5]})),
        ("p3", json!({"name": "Cy", "age": 34, "city": "Rome", "tags": [], "scores": [20]})),
        ("p4", json!({"name": "Di", "age": 51, "city": "Lima"})),
    ];
    for (key, doc) in rows {
        t.store.set_value("people", key, &object(doc), None).await.unwrap();
    }
    t
}

async fn keys(t: &TestStore, query: KeyQuery) -> Vec<String> {
    t.store.find_keys("people", query).await.unwrap()
}

fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}

#[tokio::test]
async fn test_no_conditions_returns_everything() {
    let t = people().await;
    assert_eq!(
        keys(&t, KeyQuery::new().sort_by("key")).await,
        vec!["p1", "p2", "p3", "p4"]
    );
}

#[tokio::test]
async fn test_comparisons() {
    let t = people().await;
    assert_eq!(
        sorted(keys(&t, KeyQuery::new().filter("age", Operator::Equal, 34)).await),
        vec!["p1", "p3"]
    );
    assert_eq!(
        sorted(keys(&t, KeyQuery::new().filter("age", Operator::Greater, 30)).await),
        vec!["p1", "p3", "p4"]
    );
    assert_eq!(
        keys(&t, KeyQuery::new().filter("name", Operator::NotEqual, "Ann").sort_by("name")).await,
        vec!["p2", "p3", "p4"]
    );
    assert_eq!(
        keys(&t, KeyQuery::new().filter("key", Operator::LessOrEqual, "p2").sort_by("key")).await,
        vec!["p1", "p2"]
    );
}

#[tokio::test]
async fn test_sets_are_anded_within_and_ored_across() {
    let t = people().await;
    let query = KeyQuery::new().conditions([
        Condition::new(1, "age", Operator::Equal, 34),
        Condition::new(1, "city", Operator::Equal, "Rome"),
        Condition::new(2, "name", Operator::Equal, "Di"),
    ]);
    assert_eq!(sorted(keys(&t, query).await), vec!["p3", "p4"]);
}

#[tokio::test]
async fn test_contains_on_array_and_text() {
    let t = people().await;
    assert_eq!(
        sorted(keys(&t, KeyQuery::new().filter("tags", Operator::Contains, "ops")).await),
        vec!["p1", "p2"]
    );
    assert_eq!(
        sorted(keys(&t, KeyQuery::new().filter("scores", Operator::Contains, 20)).await),
        vec!["p1", "p3"]
    );
    // Substring match on a text column.
    assert_eq!(
        sorted(keys(&t, KeyQuery::new().filter("city", Operator::Contains, "om")).await),
        vec!["p2", "p3"]
    );
}

#[tokio::test]
async fn test_two_array_conditions_in_one_set() {
    let t = people().await;
    let query = KeyQuery::new()
        .filter("tags", Operator::Contains, "ops")
        .filter("scores", Operator::Contains, 20);
    assert_eq!(keys(&t, query).await, vec!["p1"]);
}

#[tokio::test]
async fn test_in_list() {
    let t = people().await;
    assert_eq!(
        sorted(keys(&t, KeyQuery::new().filter("city", Operator::InList, vec!["Oslo", "Lima"])).await),
        vec!["p1", "p4"]
    );
    assert!(keys(&t, KeyQuery::new().filter("age", Operator::InList, Vec::<i64>::new()))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_descending_sort_with_tie_break() {
    let t = people().await;
    assert_eq!(
        keys(&t, KeyQuery::new().sort_by("age desc, name")).await,
        vec!["p4", "p1", "p3", "p2"]
    );
    assert_eq!(
        keys(&t, KeyQuery::new().sort_by("age desc, name desc")).await,
        vec!["p4", "p3", "p1", "p2"]
    );
}

#[tokio::test]
async fn test_unknown_field_matches_nothing() {
    let t = people().await;
    assert!(keys(&t, KeyQuery::new().filter("shoe", Operator::Equal, 42))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_validation_drops_whole_sets() {
    let t = people().await;
    let query = KeyQuery::new()
        .conditions([
            Condition::new(1, "age", Operator::Equal, 51),
            Condition::new(2, "age", Operator::Equal, 27),
            Condition::new(2, "shoe", Operator::Equal, 42),
        ])
        .validated();
    assert_eq!(keys(&t, query).await, vec!["p4"]);

    let everything_dropped = KeyQuery::new()
        .filter("shoe", Operator::Equal, 42)
        .validated();
    assert!(keys(&t, everything_dropped).await.is_empty());
}

#[tokio::test]
async fn test_unknown_collection_is_empty() {
    let t = people().await;
    let found = t
        .store
        .find_keys("planets", KeyQuery::new().filter("x", Operator::Equal, 1))
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_invalid_condition_is_an_error() {
    let t = people().await;
    let err = t
        .store
        .find_keys("people", KeyQuery::new().filter("tags", Operator::Equal, "ops"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Engine(_)));
}

#[tokio::test]
async fn test_queued_query_can_be_cancelled() {
    let t = people().await;

    // Nothing runs on the worker until this task yields.
    let first = t.store.find_keys_pending("people", KeyQuery::new()).unwrap();
    let second = t.store.find_keys_pending("people", KeyQuery::new()).unwrap();
    let token = second.token();
    assert!(token.cancel());

    assert_eq!(first.await.unwrap().len(), 4);
    assert!(matches!(second.await, Err(StoreError::Cancelled)));
    assert!(!token.cancel());
}
