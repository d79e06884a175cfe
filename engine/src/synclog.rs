//! Sync transport format.
//!
//! A sync file carries the change-log entries one replica has for another:
//!
//! ```json
//! {
//!   "sourceDB": "58D200A048F9",
//!   "lastSequence": 42,
//!   "logEntries": [
//!     {"timeStamp": "2024-02-01T00:00:00.000+00:00", "tableName": "people",
//!      "activity": "U", "key": "p1", "value": {"name": "Ann"}},
//!     {"timeStamp": "2024-02-01T00:00:01.000+00:00", "tableName": "people",
//!      "activity": "D", "key": "p2", "originalDB": "0C1F33B6E0A2"}
//!   ]
//! }
//! ```
//!
//! `value` only accompanies `U` entries and `originalDB` is omitted when the
//! entry originated on the sending replica.

use crate::{error::Result, schema::Collection, timestamp::Timestamp, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of change recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activity {
    /// Insert or update of a document.
    #[serde(rename = "U")]
    Update,
    /// Delete of a document.
    #[serde(rename = "D")]
    Delete,
    /// Drop of a whole collection (tombstone).
    #[serde(rename = "X")]
    Drop,
}

impl Activity {
    pub fn code(self) -> &'static str {
        match self {
            Activity::Update => "U",
            Activity::Delete => "D",
            Activity::Drop => "X",
        }
    }

    pub fn from_code(code: &str) -> Option<Activity> {
        match code {
            "U" => Some(Activity::Update),
            "D" => Some(Activity::Delete),
            "X" => Some(Activity::Drop),
            _ => None,
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One entry of a sync file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub time_stamp: Timestamp,
    pub table_name: String,
    pub activity: Activity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(
        rename = "originalDB",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Map<String, Value>>,
}

impl SyncEntry {
    /// The replica the change was first made on.
    pub fn origin<'a>(&'a self, source_db: &'a str) -> &'a str {
        self.original_db.as_deref().unwrap_or(source_db)
    }

    /// The collection this entry applies to.
    pub fn collection(&self) -> Result<Collection> {
        Collection::new(self.table_name.clone())
            .map_err(|_| Error::InvalidSyncLog(format!("invalid table name {:?}", self.table_name)))
    }

    /// The document key; required for `U` and `D`.
    pub fn document_key(&self) -> Result<&str> {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::InvalidSyncLog(format!(
                "{} entry for {} has no key",
                self.activity, self.table_name
            ))),
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        let context = |e: Error| Error::InvalidSyncLog(format!("entry {}: {}", index, e));
        self.collection().map_err(context)?;
        match self.activity {
            Activity::Update => {
                self.document_key().map_err(context)?;
                if self.value.is_none() {
                    return Err(context(Error::InvalidSyncLog("U entry has no value".into())));
                }
            }
            Activity::Delete => {
                self.document_key().map_err(context)?;
            }
            Activity::Drop => {}
        }
        Ok(())
    }
}

/// A complete sync file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFile {
    #[serde(rename = "sourceDB")]
    pub source_db: String,
    pub last_sequence: i64,
    #[serde(default)]
    pub log_entries: Vec<SyncEntry>,
}

impl SyncFile {
    pub fn new(source_db: impl Into<String>, last_sequence: i64) -> Self {
        Self {
            source_db: source_db.into(),
            last_sequence,
            log_entries: Vec::new(),
        }
    }

    /// Parse and validate a sync file. Either every entry is well formed or
    /// the whole file is rejected.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: SyncFile =
            serde_json::from_str(text).map_err(|e| Error::InvalidSyncLog(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_db.trim().is_empty() {
            return Err(Error::InvalidSyncLog("sourceDB is empty".into()));
        }
        for (index, entry) in self.log_entries.iter().enumerate() {
            entry.validate(index)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSyncLog(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.log_entries.is_empty()
    }
}
