//! Change log.
//!
//! While syncing is enabled every write, delete and drop appends an entry to
//! `__synclog`. Entries for a document are superseded by the next entry for
//! the same document, and a drop supersedes everything before it in its
//! table, so the log holds at most one entry per live document plus the
//! drop boundaries.
//!
//! Sequences come from an `autoincrement` key and are never reused, so an
//! export watermark stays valid after pruning.

use crate::error::Result;
use crate::executor::Session;
use crate::registry::Registry;
use crate::row::SqlValue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use stow_engine::{Activity, Collection, LocalHistory, Timestamp};

pub(crate) const SYNC_LOG_TABLE: &str = "__synclog";
pub(crate) const UNSYNCED_TABLE: &str = "__unsyncedTables";

/// Who made a change and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Provenance {
    /// Replica the change arrived from (this replica for local writes).
    pub source: String,
    /// Replica the change was first made on.
    pub origin: String,
    pub at: Timestamp,
}

impl Provenance {
    pub fn local(replica: &str, at: Timestamp) -> Self {
        Self {
            source: replica.to_string(),
            origin: replica.to_string(),
            at,
        }
    }
}

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogRow {
    pub sequence: i64,
    pub timestamp: Timestamp,
    pub source: String,
    pub origin: String,
    pub table: String,
    pub activity: Activity,
    pub key: Option<String>,
}

/// Whether syncing is on and which collections it skips.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    enabled: AtomicBool,
    unsynced: RwLock<HashSet<String>>,
}

impl SyncState {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether changes to `collection` go into the log.
    pub fn logs(&self, collection: &str) -> bool {
        self.is_enabled() && !self.is_unsynced(collection)
    }

    pub fn is_unsynced(&self, collection: &str) -> bool {
        self.unsynced
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(collection)
    }

    pub fn set_unsynced(&self, collections: impl IntoIterator<Item = String>) {
        let mut unsynced = self
            .unsynced
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        unsynced.clear();
        unsynced.extend(collections);
    }

    pub fn unsynced(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .unsynced
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Create the log and exclusion tables.
pub(crate) async fn create_tables(session: &mut Session) -> Result<()> {
    let statements = [
        format!(
            "create table if not exists {SYNC_LOG_TABLE} (sequence integer primary key autoincrement, \
             timestamp text not null, sourceDB text not null, originalDB text not null, \
             tableName text not null, activity text not null, key text)"
        ),
        format!("create index if not exists idx_synclog_table_key on {SYNC_LOG_TABLE} (tableName, key)"),
        format!("create index if not exists idx_synclog_timestamp on {SYNC_LOG_TABLE} (timestamp)"),
        format!("create table if not exists {UNSYNCED_TABLE} (tableName text primary key)"),
    ];
    for sql in &statements {
        session.execute(sql).await?;
    }
    Ok(())
}

pub(crate) async fn drop_tables(session: &mut Session) -> Result<()> {
    session.execute(&format!("drop table if exists {SYNC_LOG_TABLE}")).await?;
    session.execute(&format!("drop table if exists {UNSYNCED_TABLE}")).await?;
    Ok(())
}

pub(crate) async fn tables_exist(session: &mut Session) -> Result<bool> {
    session
        .exists(
            "select 1 from sqlite_master where type = 'table' and name = ?",
            &[SqlValue::from(SYNC_LOG_TABLE)],
        )
        .await
}

/// Append an entry and prune what it supersedes. Returns its sequence.
pub(crate) async fn record(
    session: &mut Session,
    provenance: &Provenance,
    table: &str,
    activity: Activity,
    key: Option<&str>,
) -> Result<i64> {
    let sequence = append(session, provenance, table, activity, key).await?;

    let pruned = match (activity, key) {
        (Activity::Drop, _) | (_, None) => {
            session
                .execute_with(
                    &format!("delete from {SYNC_LOG_TABLE} where tableName = ? and sequence < ?"),
                    &[SqlValue::from(table), SqlValue::Integer(sequence)],
                )
                .await?
        }
        (_, Some(key)) => {
            session
                .execute_with(
                    &format!(
                        "delete from {SYNC_LOG_TABLE} where tableName = ? and key = ? and sequence < ?"
                    ),
                    &[SqlValue::from(table), SqlValue::from(key), SqlValue::Integer(sequence)],
                )
                .await?
        }
    };

    tracing::trace!(
        sequence,
        table,
        activity = %activity,
        pruned = pruned.rows_affected,
        "Change logged"
    );
    Ok(sequence)
}

/// Append an entry without pruning. Returns its sequence.
pub(crate) async fn append(
    session: &mut Session,
    provenance: &Provenance,
    table: &str,
    activity: Activity,
    key: Option<&str>,
) -> Result<i64> {
    let inserted = session
        .execute_with(
            &format!(
                "insert into {SYNC_LOG_TABLE} (timestamp, sourceDB, originalDB, tableName, activity, key) \
                 values (?, ?, ?, ?, ?, ?)"
            ),
            &[
                SqlValue::from(provenance.at),
                SqlValue::from(provenance.source.as_str()),
                SqlValue::from(provenance.origin.as_str()),
                SqlValue::from(table),
                SqlValue::from(activity.code()),
                SqlValue::from(key),
            ],
        )
        .await?;
    Ok(inserted.last_insert_rowid)
}

/// Remove every entry for one document.
pub(crate) async fn purge_key(session: &mut Session, table: &str, key: &str) -> Result<u64> {
    let done = session
        .execute_with(
            &format!("delete from {SYNC_LOG_TABLE} where tableName = ? and key = ?"),
            &[SqlValue::from(table), SqlValue::from(key)],
        )
        .await?;
    Ok(done.rows_affected)
}

/// Remove every entry of a table made before `before`.
pub(crate) async fn purge_before(session: &mut Session, table: &str, before: Timestamp) -> Result<u64> {
    let done = session
        .execute_with(
            &format!("delete from {SYNC_LOG_TABLE} where tableName = ? and timestamp < ?"),
            &[SqlValue::from(table), SqlValue::from(before)],
        )
        .await?;
    Ok(done.rows_affected)
}

/// Remove every entry of the given tables.
pub(crate) async fn purge_tables(session: &mut Session, tables: &[String]) -> Result<()> {
    for table in tables {
        session
            .execute_with(
                &format!("delete from {SYNC_LOG_TABLE} where tableName = ?"),
                &[SqlValue::from(table.as_str())],
            )
            .await?;
    }
    Ok(())
}

/// What the log knows about a table and, optionally, one of its documents.
pub(crate) async fn history(session: &mut Session, table: &str, key: Option<&str>) -> Result<LocalHistory> {
    let latest_tombstone = max_timestamp(
        session,
        &format!("select max(timestamp) from {SYNC_LOG_TABLE} where tableName = ? and activity = 'X'"),
        &[SqlValue::from(table)],
    )
    .await?;

    let latest_for_key = match key {
        Some(key) => {
            max_timestamp(
                session,
                &format!("select max(timestamp) from {SYNC_LOG_TABLE} where tableName = ? and key = ?"),
                &[SqlValue::from(table), SqlValue::from(key)],
            )
            .await?
        }
        None => None,
    };

    Ok(LocalHistory {
        latest_for_key,
        latest_tombstone,
    })
}

async fn max_timestamp(session: &mut Session, sql: &str, params: &[SqlValue]) -> Result<Option<Timestamp>> {
    let rows = session.query_with(sql, params).await?;
    Ok(rows.first().and_then(|row| row.get(0).as_timestamp()))
}

/// Entries after `since` that neither came from nor originated on `target`.
pub(crate) async fn since(session: &mut Session, since: i64, target: &str) -> Result<Vec<LogRow>> {
    let rows = session
        .query_with(
            &format!(
                "select sequence, timestamp, sourceDB, originalDB, tableName, activity, key \
                 from {SYNC_LOG_TABLE} where sequence > ? and sourceDB <> ? and originalDB <> ? \
                 order by sequence"
            ),
            &[
                SqlValue::Integer(since),
                SqlValue::from(target),
                SqlValue::from(target),
            ],
        )
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(sequence), Some(timestamp), Some(activity)) = (
            row.int(0),
            row.get(1).as_timestamp(),
            row.text(5).and_then(Activity::from_code),
        ) else {
            tracing::warn!(row = ?row, "Skipping unreadable change log row");
            continue;
        };
        entries.push(LogRow {
            sequence,
            timestamp,
            source: row.text(2).unwrap_or_default().to_string(),
            origin: row.text(3).unwrap_or_default().to_string(),
            table: row.text(4).unwrap_or_default().to_string(),
            activity,
            key: row.text(6).map(String::from),
        });
    }
    Ok(entries)
}

/// Whether an identical tombstone is already recorded.
pub(crate) async fn has_tombstone(session: &mut Session, table: &str, at: Timestamp) -> Result<bool> {
    session
        .exists(
            &format!(
                "select 1 from {SYNC_LOG_TABLE} where tableName = ? and activity = 'X' and timestamp = ?"
            ),
            &[SqlValue::from(table), SqlValue::from(at)],
        )
        .await
}

pub(crate) async fn load_unsynced(session: &mut Session) -> Result<Vec<String>> {
    session
        .query_strings(&format!("select tableName from {UNSYNCED_TABLE} order by tableName"), &[])
        .await
}

pub(crate) async fn save_unsynced(session: &mut Session, tables: &[String]) -> Result<()> {
    session.execute(&format!("delete from {UNSYNCED_TABLE}")).await?;
    for table in tables {
        session
            .execute_with(
                &format!("insert or ignore into {UNSYNCED_TABLE} (tableName) values (?)"),
                &[SqlValue::from(table.as_str())],
            )
            .await?;
    }
    Ok(())
}

/// Log a `U` entry for every existing document of every synced collection.
///
/// Each entry carries the document's own update time so later imports
/// compare against when the document really changed.
pub(crate) async fn seed(
    session: &mut Session,
    registry: &Registry,
    sync: &SyncState,
    provenance: &Provenance,
) -> Result<u64> {
    let mut seeded = 0;
    for name in registry.names() {
        if sync.is_unsynced(&name) {
            continue;
        }
        let Ok(collection) = Collection::new(name) else {
            continue;
        };
        let done = session
            .execute_with(
                &format!(
                    "insert into {SYNC_LOG_TABLE} (timestamp, sourceDB, originalDB, tableName, activity, key) \
                     select coalesce(\"updatedDateTime\", ?), ?, ?, ?, 'U', \"key\" from {}",
                    collection.table()
                ),
                &[
                    SqlValue::from(provenance.at),
                    SqlValue::from(provenance.source.as_str()),
                    SqlValue::from(provenance.origin.as_str()),
                    SqlValue::from(collection.as_str()),
                ],
            )
            .await?;
        seeded += done.rows_affected;
    }
    Ok(seeded)
}
