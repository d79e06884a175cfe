//! Metadata tables and instance identity.

use crate::error::Result;
use crate::executor::Session;
use crate::registry::ARRAY_COLUMNS_TABLE;
use crate::row::SqlValue;

pub(crate) const SETTINGS_TABLE: &str = "__settings";
/// Current metadata layout version.
pub(crate) const SCHEMA_VERSION: i64 = 2;

/// Create the metadata tables and bring the layout version up to date.
pub(crate) async fn ensure_metadata(session: &mut Session) -> Result<()> {
    session
        .execute(&format!(
            "create table if not exists {SETTINGS_TABLE} (key text primary key, value text)"
        ))
        .await?;
    session
        .execute(&format!(
            "create table if not exists {ARRAY_COLUMNS_TABLE} (tableName text primary key, arrayColumns text)"
        ))
        .await?;

    match get(session, "schema").await? {
        None => set(session, "schema", &SCHEMA_VERSION.to_string()).await?,
        Some(version) => {
            let version: i64 = version.trim().parse().unwrap_or(1);
            if version < SCHEMA_VERSION {
                // Version 1 files differ only in the recorded version.
                set(session, "schema", &SCHEMA_VERSION.to_string()).await?;
                tracing::info!(from = version, to = SCHEMA_VERSION, "Upgraded metadata schema");
            }
        }
    }
    Ok(())
}

/// The persisted instance key, generated on first use.
///
/// Keys are the last twelve hex digits of a random UUID, upper case.
pub(crate) async fn instance_key(session: &mut Session) -> Result<String> {
    if let Some(key) = get(session, "dbInstanceKey").await? {
        return Ok(key);
    }
    let key = new_instance_key();
    set(session, "dbInstanceKey", &key).await?;
    tracing::info!(instance = %key, "Generated instance key");
    Ok(key)
}

fn new_instance_key() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    uuid[uuid.len() - 12..].to_string()
}

async fn get(session: &mut Session, key: &str) -> Result<Option<String>> {
    let values = session
        .query_strings(
            &format!("select value from {SETTINGS_TABLE} where key = ?"),
            &[SqlValue::from(key)],
        )
        .await?;
    Ok(values.into_iter().next())
}

async fn set(session: &mut Session, key: &str, value: &str) -> Result<()> {
    session
        .execute_with(
            &format!("delete from {SETTINGS_TABLE} where key = ?"),
            &[SqlValue::from(key)],
        )
        .await?;
    session
        .execute_with(
            &format!("insert into {SETTINGS_TABLE} (key, value) values (?, ?)"),
            &[SqlValue::from(key), SqlValue::from(value)],
        )
        .await?;
    Ok(())
}
