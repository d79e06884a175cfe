//! Key queries and raw selects.

use crate::error::Result;
use crate::executor::Session;
use crate::row::Row;
use crate::store::Shared;
use stow_engine::{Collection, CompiledQuery, KeyQuery};

/// Keys of the documents matching `query`, in the requested order.
///
/// An unknown collection has no documents.
pub(crate) async fn find_keys(
    shared: &Shared,
    session: &mut Session,
    collection: &Collection,
    query: &KeyQuery,
) -> Result<Vec<String>> {
    let Some(schema) = shared.registry.get(collection.as_str()) else {
        return Ok(Vec::new());
    };

    let sql = match query.compile(collection, &schema)? {
        CompiledQuery::Sql(sql) => sql,
        CompiledQuery::NoMatch => {
            tracing::debug!(collection = %collection, "Every condition set was dropped by validation");
            return Ok(Vec::new());
        }
    };

    let mut keys = session.query_strings(&sql, &[]).await?;
    dedup_in_order(&mut keys);
    Ok(keys)
}

/// Run a caller-supplied select.
pub(crate) async fn select_rows(session: &mut Session, sql: &str) -> Result<Vec<Row>> {
    session.query(sql).await
}

fn dedup_in_order(keys: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    keys.retain(|key| seen.insert(key.clone()));
}
