//! Document writer and reader.
//!
//! A write is full-replace: the main-table row receives every scalar field of
//! the new document and NULL for every other column, and the document's side
//! rows are deleted and reinserted. Each write runs inside a savepoint so a
//! failure part way through leaves nothing behind.

use crate::changelog::{self, Provenance};
use crate::error::{Result, StoreError};
use crate::executor::Session;
use crate::row::SqlValue;
use crate::store::Shared;
use crate::subscriptions::ChangeEvent;
use stow_engine::schema::{quote_ident, ArrayManifest, MANIFEST_COLUMN};
use stow_engine::{Activity, Collection, Document, FieldType, FieldValue, StoredDocument, Timestamp};

const SAVEPOINT: &str = "stow_write";
/// Keys per `in (...)` probe, well under SQLite's parameter limit.
const KEY_CHUNK: usize = 500;

/// System timestamps supplied with a write.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteDates {
    pub auto_delete: Option<Timestamp>,
    /// Creation time to keep when the document is new; defaults to now.
    pub added: Option<Timestamp>,
    /// Update time carried by an imported document; defaults to now.
    pub updated: Option<Timestamp>,
}

/// Why a document is being deleted.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DeleteMode<'a> {
    /// A caller or an incoming sync entry removed it.
    Explicit(&'a Provenance),
    /// The expiry sweep removed it; every replica expires it on its own.
    Expired,
}

pub(crate) async fn begin(session: &mut Session) -> Result<()> {
    session.execute(&format!("savepoint {SAVEPOINT}")).await?;
    Ok(())
}

pub(crate) async fn commit(session: &mut Session) -> Result<()> {
    session.execute(&format!("release {SAVEPOINT}")).await?;
    Ok(())
}

/// Undo everything since the savepoint but keep it open.
async fn rewind(session: &mut Session) {
    if let Err(e) = session.execute(&format!("rollback to {SAVEPOINT}")).await {
        tracing::warn!(error = %e, "Failed to roll back savepoint");
    }
}

pub(crate) async fn abort(session: &mut Session) {
    rewind(session).await;
    if let Err(e) = session.execute(&format!("release {SAVEPOINT}")).await {
        tracing::warn!(error = %e, "Failed to release savepoint");
    }
}

/// Insert or replace a document.
pub(crate) async fn set_value(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    document: Document,
    dates: WriteDates,
    provenance: &Provenance,
) -> Result<()> {
    begin(session).await?;

    let mut outcome = write_document(shared, session, collection, document.clone(), dates, provenance).await;
    let retry = match &outcome {
        Err(e) if e.is_storage() => {
            tracing::warn!(collection = %collection, key = document.key(), error = %e, "Write failed, re-reading schema and retrying");
            true
        }
        _ => false,
    };
    if retry {
        rewind(session).await;
        outcome = match shared.registry.refresh_collection(session, collection).await {
            Ok(()) => write_document(shared, session, collection, document.clone(), dates, provenance).await,
            Err(refresh_error) => Err(refresh_error),
        };
    }

    match outcome {
        Ok(()) => {
            commit(session).await?;
            shared.subscriptions.publish(ChangeEvent::Updated {
                collection: collection.to_string(),
                key: document.key().to_string(),
            });
            Ok(())
        }
        Err(e) => {
            abort(session).await;
            forget_rolled_back(shared, session, collection).await;
            Err(e)
        }
    }
}

/// A rollback may have undone columns the registry already cached.
async fn forget_rolled_back(shared: &Shared, session: &mut Session, collection: &Collection) {
    if let Err(e) = shared.registry.refresh_collection(session, collection).await {
        tracing::warn!(collection = %collection, error = %e, "Failed to re-read schema after rollback");
        shared.registry.forget(collection.as_str());
    }
}

async fn write_document(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    mut document: Document,
    dates: WriteDates,
    provenance: &Provenance,
) -> Result<()> {
    let schema = shared.registry.reconcile(session, collection, &mut document).await?;
    let key = document.key().to_string();
    let table = collection.table();
    let manifest = document.array_manifest().format();
    let updated = dates.updated.unwrap_or(provenance.at);

    let exists = session
        .exists(
            &format!("select 1 from {table} where \"key\" = ?"),
            &[SqlValue::from(key.as_str())],
        )
        .await?;

    if exists {
        let mut assignments = vec![
            "\"updatedDateTime\" = ?".to_string(),
            "\"autoDeleteDateTime\" = ?".to_string(),
            format!("{} = ?", quote_ident(MANIFEST_COLUMN)),
        ];
        let mut params = vec![
            SqlValue::from(updated),
            SqlValue::from(dates.auto_delete),
            SqlValue::from(manifest),
        ];
        for (column, _) in schema.columns() {
            assignments.push(format!("{} = ?", quote_ident(column)));
            params.push(document.get(column).map(SqlValue::from).unwrap_or(SqlValue::Null));
        }
        params.push(SqlValue::from(key.as_str()));
        let sql = format!(
            "update {table} set {} where \"key\" = ?",
            assignments.join(", ")
        );
        session.execute_with(&sql, &params).await?;
    } else {
        let mut columns = vec![
            "\"key\"".to_string(),
            "\"addedDateTime\"".to_string(),
            "\"updatedDateTime\"".to_string(),
            "\"autoDeleteDateTime\"".to_string(),
            quote_ident(MANIFEST_COLUMN),
        ];
        let mut params = vec![
            SqlValue::from(key.as_str()),
            SqlValue::from(dates.added.unwrap_or(provenance.at)),
            SqlValue::from(updated),
            SqlValue::from(dates.auto_delete),
            SqlValue::from(manifest),
        ];
        for (field, value) in document.scalars() {
            columns.push(quote_ident(field));
            params.push(SqlValue::from(value));
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "insert into {table} ({}) values ({placeholders})",
            columns.join(", ")
        );
        session.execute_with(&sql, &params).await?;
    }

    write_array_rows(session, collection, &document).await?;

    if shared.sync.logs(collection.as_str()) {
        changelog::record(session, provenance, collection.as_str(), Activity::Update, Some(key.as_str())).await?;
    }
    Ok(())
}

async fn write_array_rows(session: &mut Session, collection: &Collection, document: &Document) -> Result<()> {
    let side = collection.array_table();
    let key = document.key();
    session
        .execute_with(
            &format!("delete from {side} where \"key\" = ?"),
            &[SqlValue::from(key)],
        )
        .await?;

    let insert = format!(
        "insert into {side} (\"key\", \"objectKey\", \"stringValue\", \"intValue\", \"doubleValue\") values (?, ?, ?, ?, ?)"
    );
    for (field, value) in document.arrays() {
        let elements: Vec<[SqlValue; 3]> = match value {
            FieldValue::TextArray(items) => items
                .iter()
                .map(|s| [SqlValue::from(s.as_str()), SqlValue::Null, SqlValue::Null])
                .collect(),
            FieldValue::IntArray(items) => items
                .iter()
                .map(|i| [SqlValue::Null, SqlValue::Integer(*i), SqlValue::Null])
                .collect(),
            FieldValue::DoubleArray(items) => items
                .iter()
                .map(|d| [SqlValue::Null, SqlValue::Null, SqlValue::Real(*d)])
                .collect(),
            _ => continue,
        };
        for [text, int, double] in elements {
            session
                .execute_with(
                    &insert,
                    &[SqlValue::from(key), SqlValue::from(field), text, int, double],
                )
                .await?;
        }
    }
    Ok(())
}

/// Read a document back with its system timestamps.
pub(crate) async fn read_document(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    key: &str,
) -> Result<Option<StoredDocument>> {
    let Some(schema) = shared.registry.get(collection.as_str()) else {
        return Ok(None);
    };
    let columns: Vec<(&str, FieldType)> = schema.columns().collect();

    let mut select = vec![
        "\"addedDateTime\"".to_string(),
        "\"updatedDateTime\"".to_string(),
        "\"autoDeleteDateTime\"".to_string(),
        quote_ident(MANIFEST_COLUMN),
    ];
    select.extend(columns.iter().map(|(c, _)| quote_ident(c)));
    let sql = format!(
        "select {} from {} where \"key\" = ?",
        select.join(", "),
        collection.table()
    );
    let rows = session.query_with(&sql, &[SqlValue::from(key)]).await?;
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };

    let mut fields = Vec::new();
    for (index, (column, ty)) in columns.iter().enumerate() {
        if let Some(value) = row.get(4 + index).to_field(*ty) {
            fields.push((column.to_string(), value));
        }
    }

    let manifest = row.text(3).map(ArrayManifest::parse).unwrap_or_default();
    if !manifest.is_empty() {
        fields.extend(read_arrays(session, collection, key, &manifest).await?);
    }

    let mut stored = StoredDocument::from_parts(key, fields)?;
    stored.added = row.get(0).as_timestamp();
    stored.updated = row.get(1).as_timestamp();
    stored.auto_delete = row.get(2).as_timestamp();
    Ok(Some(stored))
}

async fn read_arrays(
    session: &mut Session,
    collection: &Collection,
    key: &str,
    manifest: &ArrayManifest,
) -> Result<Vec<(String, FieldValue)>> {
    let rows = session
        .query_with(
            &format!(
                "select \"objectKey\", \"stringValue\", \"intValue\", \"doubleValue\" from {} where \"key\" = ? order by rowid",
                collection.array_table()
            ),
            &[SqlValue::from(key)],
        )
        .await?;

    let mut arrays: Vec<(String, FieldValue)> = manifest
        .iter()
        .map(|(field, ty)| {
            let empty = match ty {
                FieldType::IntArray => FieldValue::IntArray(Vec::new()),
                FieldType::DoubleArray => FieldValue::DoubleArray(Vec::new()),
                _ => FieldValue::TextArray(Vec::new()),
            };
            (field.to_string(), empty)
        })
        .collect();

    for row in rows {
        let Some(field) = row.text(0) else { continue };
        let Some((_, array)) = arrays.iter_mut().find(|(name, _)| name == field) else {
            continue;
        };
        match array {
            FieldValue::TextArray(items) => items.extend(row.text(1).map(String::from)),
            FieldValue::IntArray(items) => items.extend(row.int(2)),
            FieldValue::DoubleArray(items) => items.extend(row.get(3).as_f64()),
            _ => {}
        }
    }
    Ok(arrays)
}

/// Delete a document. Returns whether it existed.
pub(crate) async fn delete_value(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    key: &str,
    mode: DeleteMode<'_>,
) -> Result<bool> {
    begin(session).await?;
    match delete_document(shared, session, collection, key, mode).await {
        Ok(existed) => {
            commit(session).await?;
            if existed {
                shared.subscriptions.publish(ChangeEvent::Deleted {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    expired: matches!(mode, DeleteMode::Expired),
                });
            }
            Ok(existed)
        }
        Err(e) => {
            abort(session).await;
            Err(e)
        }
    }
}

async fn delete_document(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    key: &str,
    mode: DeleteMode<'_>,
) -> Result<bool> {
    let params = [SqlValue::from(key)];
    let existed = if shared.registry.contains(collection.as_str()) {
        let done = session
            .execute_with(
                &format!("delete from {} where \"key\" = ?", collection.table()),
                &params,
            )
            .await?;
        session
            .execute_with(
                &format!("delete from {} where \"key\" = ?", collection.array_table()),
                &params,
            )
            .await?;
        done.rows_affected > 0
    } else {
        false
    };

    if shared.sync.logs(collection.as_str()) {
        match mode {
            DeleteMode::Explicit(provenance) => {
                changelog::record(session, provenance, collection.as_str(), Activity::Delete, Some(key)).await?;
            }
            DeleteMode::Expired => {
                changelog::purge_key(session, collection.as_str(), key).await?;
            }
        }
    }
    Ok(existed)
}

/// Drop a collection's tables and manifest.
pub(crate) async fn drop_collection(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    provenance: Option<&Provenance>,
) -> Result<()> {
    if !shared.registry.contains(collection.as_str()) {
        return Err(StoreError::TableNotFound(collection.to_string()));
    }

    begin(session).await?;
    let outcome = async {
        session
            .execute(&format!("drop table if exists {}", collection.table()))
            .await?;
        session
            .execute(&format!("drop table if exists {}", collection.array_table()))
            .await?;
        crate::registry::clear_manifest(session, collection).await?;
        if let Some(provenance) = provenance {
            if shared.sync.logs(collection.as_str()) {
                changelog::record(session, provenance, collection.as_str(), Activity::Drop, None).await?;
            }
        }
        Ok::<_, StoreError>(())
    }
    .await;

    match outcome {
        Ok(()) => {
            commit(session).await?;
            shared.registry.forget(collection.as_str());
            tracing::info!(collection = %collection, "Collection dropped");
            shared.subscriptions.publish(ChangeEvent::Dropped {
                collection: collection.to_string(),
            });
            Ok(())
        }
        Err(e) => {
            abort(session).await;
            Err(e)
        }
    }
}

/// Remove documents last updated before `before`, as an incoming drop
/// tombstone requires. Returns how many were removed.
pub(crate) async fn purge_before(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    before: Timestamp,
) -> Result<u64> {
    if !shared.registry.contains(collection.as_str()) {
        return Ok(0);
    }
    let done = session
        .execute_with(
            &format!(
                "delete from {} where \"updatedDateTime\" is null or \"updatedDateTime\" < ?",
                collection.table()
            ),
            &[SqlValue::from(before)],
        )
        .await?;
    session
        .execute(&format!(
            "delete from {} where \"key\" not in (select \"key\" from {})",
            collection.array_table(),
            collection.table()
        ))
        .await?;
    Ok(done.rows_affected)
}

pub(crate) async fn has_key(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    key: &str,
) -> Result<bool> {
    if !shared.registry.contains(collection.as_str()) {
        return Ok(false);
    }
    session
        .exists(
            &format!("select 1 from {} where \"key\" = ?", collection.table()),
            &[SqlValue::from(key)],
        )
        .await
}

/// Whether every one of `keys` is present. Duplicates count once.
pub(crate) async fn has_all_keys(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    keys: &[String],
) -> Result<bool> {
    if !shared.registry.contains(collection.as_str()) {
        return Ok(false);
    }
    let mut unique: Vec<&str> = keys.iter().map(String::as_str).collect();
    unique.sort_unstable();
    unique.dedup();

    for chunk in unique.chunks(KEY_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let params: Vec<SqlValue> = chunk.iter().map(|k| SqlValue::from(*k)).collect();
        let rows = session
            .query_with(
                &format!(
                    "select count(*) from {} where \"key\" in ({placeholders})",
                    collection.table()
                ),
                &params,
            )
            .await?;
        let found = rows.first().and_then(|row| row.int(0)).unwrap_or(0);
        if found != chunk.len() as i64 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Keys whose auto-delete time has passed.
pub(crate) async fn expired_keys(
    session: &mut Session,
    collection: &Collection,
    now: Timestamp,
) -> Result<Vec<String>> {
    session
        .query_strings(
            &format!(
                "select \"key\" from {} where \"autoDeleteDateTime\" is not null and \"autoDeleteDateTime\" < ?",
                collection.table()
            ),
            &[SqlValue::from(now)],
        )
        .await
}
