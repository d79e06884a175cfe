//! # Stow Engine
//!
//! Pure logic behind the Stow document store.
//!
//! Stow stores flexibly shaped JSON documents in SQLite: each collection gets a
//! main table with one column per scalar field, and a side table holding one
//! row per array element. This crate owns everything about that mapping that
//! does not touch a database handle.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never opens files or connections
//! - **Deterministic**: the same inputs always compile to the same SQL and
//!   produce the same reconcile decisions
//! - **Testable**: pure functions, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] is a key plus a flat set of fields. Each field is classified
//! into a [`FieldValue`]: text, int, double, bool, or a homogeneous text, int
//! or double array. Nested objects are rejected.
//!
//! ### Schemas
//!
//! A [`CollectionSchema`] records the established type of each column and
//! the [`ArrayManifest`] of array fields. [`CollectionSchema::conform`] checks
//! a document against it and reports the additive changes needed.
//!
//! ### Queries
//!
//! A [`KeyQuery`] is a list of [`Condition`]s grouped into numbered sets:
//! conditions in one set are ANDed and sets are ORed. It compiles into a
//! single `select key` statement.
//!
//! ### Sync
//!
//! Replicas exchange [`SyncFile`]s of change-log entries. The [`Reconciler`]
//! decides, last writer wins by timestamp, which incoming entries apply.
//!
//! ## Quick Start
//!
//! ```rust
//! use stow_engine::{Collection, CollectionSchema, CompiledQuery, Document, KeyQuery, Operator};
//! use serde_json::json;
//!
//! let people = Collection::new("people").unwrap();
//! let mut schema = CollectionSchema::new();
//!
//! let mut doc = Document::from_json("p1", &json!({"name": "Ann", "tags": ["a"]})).unwrap();
//! let changes = schema.conform(&mut doc).unwrap();
//! schema.apply(&changes);
//!
//! let query = KeyQuery::new().filter("tags", Operator::Contains, "a");
//! assert!(matches!(query.compile(&people, &schema).unwrap(), CompiledQuery::Sql(_)));
//! ```

pub mod document;
pub mod error;
pub mod query;
pub mod reconcile;
pub mod schema;
pub mod synclog;
pub mod timestamp;
pub mod value;

// Re-export main types at crate root
pub use document::{Document, StoredDocument};
pub use error::{Error, Result};
pub use query::{CompiledQuery, Condition, ConditionValue, KeyQuery, Operator};
pub use reconcile::{
    ConflictResolution, ImportReport, LocalHistory, Reconciler, SkipReason, Verdict,
};
pub use schema::{ArrayManifest, Collection, CollectionSchema, SchemaChanges};
pub use synclog::{Activity, SyncEntry, SyncFile};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};
pub use value::{FieldType, FieldValue};

/// Type aliases for clarity
pub type DocumentKey = String;
pub type ReplicaId = String;
pub type Sequence = i64;
