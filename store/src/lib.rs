//! # Stow Store
//!
//! Embedded document store over SQLite, with change logging and
//! log-based synchronization between replicas.
//!
//! All database work runs on one worker task that owns the only connection;
//! the [`Store`] handle queues jobs and awaits them. The pure mapping of
//! documents, schemas, queries and sync files lives in [`stow_engine`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use stow_store::{KeyQuery, Operator, Store, StoreConfig};
//!
//! # async fn demo() -> stow_store::Result<()> {
//! let store = Store::open(StoreConfig::new("app.db")).await?;
//!
//! let doc = json!({"name": "Ann", "age": 34, "tags": ["admin"]});
//! store.set_value("people", "p1", doc.as_object().unwrap(), None).await?;
//!
//! let keys = store
//!     .find_keys("people", KeyQuery::new().filter("tags", Operator::Contains, "admin"))
//!     .await?;
//! assert_eq!(keys, vec!["p1".to_string()]);
//! # Ok(())
//! # }
//! ```

mod changelog;
pub mod config;
pub mod error;
pub mod executor;
mod query;
mod registry;
pub mod row;
mod settings;
mod store;
pub mod subscriptions;
mod sweeper;
pub mod sync;
mod writer;

pub use config::{ConfigError, StoreConfig};
pub use error::{Result, StoreError};
pub use executor::{CommandToken, Pending};
pub use row::{Row, SqlValue};
pub use store::Store;
pub use subscriptions::{ChangeEvent, Subscription};
pub use sync::{ImportOutcome, Progress};

pub use stow_engine::{
    Activity, Clock, CompiledQuery, Condition, ConditionValue, Document, FieldType, FieldValue,
    ImportReport, KeyQuery, ManualClock, Operator, StoredDocument, SyncEntry, SyncFile,
    SystemClock, Timestamp,
};
