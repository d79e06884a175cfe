//! Shared helpers for store integration tests.

#![allow(dead_code)]

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor};
use std::sync::{Arc, Once};
use stow_store::{ManualClock, Store, StoreConfig, Timestamp};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. `RUST_LOG` filters it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "stow_store=warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// 2024-02-01T00:00:00.000Z
pub const EPOCH_MILLIS: i64 = 1_706_745_600_000;

pub fn ts(offset_millis: i64) -> Timestamp {
    Timestamp::from_millis(EPOCH_MILLIS + offset_millis).unwrap()
}

/// A store on a fresh file with a manual clock and no background sweep.
pub struct TestStore {
    pub store: Store,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir, "store.db").await
    }

    pub async fn in_dir(dir: TempDir, file: &str) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(ts(0)));
        let store = open(&dir, file, clock.clone()).await;
        Self { store, clock, dir }
    }

    pub fn advance(&self, millis: i64) {
        self.clock.advance_millis(millis);
    }
}

pub fn config(dir: &TempDir, file: &str) -> StoreConfig {
    StoreConfig::new(dir.path().join(file)).with_expiry_interval(None)
}

/// Run statements on the store's file through a second connection, behind
/// the store's back.
pub async fn execute_behind(dir: &TempDir, file: &str, statements: &[&str]) {
    let mut conn = SqliteConnectOptions::new()
        .filename(dir.path().join(file))
        .connect()
        .await
        .unwrap();
    for sql in statements {
        conn.execute(*sql).await.unwrap();
    }
    conn.close().await.unwrap();
}

pub async fn open(dir: &TempDir, file: &str, clock: Arc<ManualClock>) -> Store {
    Store::open_with_clock(config(dir, file), clock).await.unwrap()
}

/// Unwrap a `json!` object literal.
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}
