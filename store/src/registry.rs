//! Schema registry.
//!
//! Caches the shape of every collection: its scalar columns with their
//! declared types and its array manifest. The cache is rebuilt from the
//! catalog when the file is opened and updated in place as writes add
//! columns. All mutations run on the worker; reads go through the map's own
//! shard locks.

use crate::error::{Result, StoreError};
use crate::executor::Session;
use crate::row::SqlValue;
use dashmap::DashMap;
use stow_engine::schema::{
    is_collection_table, quote_ident, ADDED_COLUMN, AUTO_DELETE_COLUMN, KEY_COLUMN,
    MANIFEST_COLUMN, SYSTEM_COLUMNS, UPDATED_COLUMN,
};
use stow_engine::{ArrayManifest, Collection, CollectionSchema, Document, FieldType};

/// Metadata table holding each collection's array manifest.
pub(crate) const ARRAY_COLUMNS_TABLE: &str = "__tableArrayColumns";

#[derive(Debug, Default)]
pub(crate) struct Registry {
    collections: DashMap<String, CollectionSchema>,
    /// Requested secondary indexes per collection, each a list of columns.
    indexes: DashMap<String, Vec<Vec<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<CollectionSchema> {
        self.collections.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Known collection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn forget(&self, name: &str) {
        self.collections.remove(name);
    }

    /// Rebuild the whole cache from the catalog.
    pub async fn refresh(&self, session: &mut Session) -> Result<()> {
        let tables = session
            .query_strings("select name from sqlite_master where type = 'table'", &[])
            .await?;

        self.collections.clear();
        for table in tables.into_iter().filter(|t| is_collection_table(t)) {
            let Ok(collection) = Collection::new(table) else {
                continue;
            };
            if let Some(schema) = load(session, &collection).await? {
                self.collections.insert(collection.as_str().to_string(), schema);
            }
        }

        tracing::debug!(collections = self.collections.len(), "Schema registry refreshed");
        Ok(())
    }

    /// Re-read one collection from the catalog.
    pub async fn refresh_collection(&self, session: &mut Session, collection: &Collection) -> Result<()> {
        match load(session, collection).await? {
            Some(schema) => {
                self.collections.insert(collection.as_str().to_string(), schema);
            }
            None => self.forget(collection.as_str()),
        }
        Ok(())
    }

    /// Create the main and side tables if needed. Idempotent.
    pub async fn ensure_collection(
        &self,
        session: &mut Session,
        collection: &Collection,
    ) -> Result<CollectionSchema> {
        if let Some(schema) = self.get(collection.as_str()) {
            return Ok(schema);
        }

        let table = collection.table();
        let side = collection.array_table();
        let name = collection.as_str();
        let statements = [
            format!(
                "create table if not exists {table} ({} text primary key, {} text, {} text, {} text, {} text)",
                quote_ident(KEY_COLUMN),
                quote_ident(AUTO_DELETE_COLUMN),
                quote_ident(ADDED_COLUMN),
                quote_ident(UPDATED_COLUMN),
                quote_ident(MANIFEST_COLUMN),
            ),
            format!(
                "create index if not exists {} on {table} ({})",
                quote_ident(&format!("idx_{name}_autoDeleteDateTime")),
                quote_ident(AUTO_DELETE_COLUMN),
            ),
            format!(
                "create table if not exists {side} (\"key\" text, \"objectKey\" text, \"stringValue\" text, \"intValue\" int, \"doubleValue\" double)"
            ),
            format!(
                "create index if not exists {} on {side} (\"key\", \"objectKey\")",
                quote_ident(&format!("idx_{name}_arrayValues_keys")),
            ),
        ];
        for sql in &statements {
            session.execute(sql).await?;
        }

        // The tables may already have existed with columns we never cached.
        let schema = load(session, collection).await?.unwrap_or_default();
        self.collections.insert(name.to_string(), schema.clone());
        tracing::info!(collection = %collection, "Collection created");
        Ok(schema)
    }

    /// Add the columns and manifest entries `document` needs.
    ///
    /// Fails with a type mismatch if the document retypes an established
    /// field; nothing is altered in that case.
    pub async fn reconcile(
        &self,
        session: &mut Session,
        collection: &Collection,
        document: &mut Document,
    ) -> Result<CollectionSchema> {
        let mut schema = self.ensure_collection(session, collection).await?;
        let changes = schema.conform(document)?;
        if changes.is_empty() {
            return Ok(schema);
        }

        for (column, ty) in &changes.new_columns {
            let sql = format!(
                "alter table {} add column {} {}",
                collection.table(),
                quote_ident(column),
                ty.sql_type()
            );
            session.execute(&sql).await?;
            tracing::debug!(collection = %collection, column = %column, column_type = %ty, "Column added");
        }

        let arrays_changed = !changes.new_arrays.is_empty();
        schema.apply(&changes);
        if arrays_changed {
            save_manifest(session, collection, schema.arrays()).await?;
        }

        self.collections
            .insert(collection.as_str().to_string(), schema.clone());

        if !changes.new_columns.is_empty() {
            self.create_indexes(session, collection, &schema).await?;
        }
        Ok(schema)
    }

    /// Replace the secondary indexes of a collection.
    ///
    /// Each spec is a comma-separated column list; a compound index spans all
    /// of them. Indexes over columns that do not exist yet are created once a
    /// write adds the columns.
    pub async fn set_indexes(
        &self,
        session: &mut Session,
        collection: &Collection,
        specs: Vec<Vec<String>>,
    ) -> Result<()> {
        let name = collection.as_str();
        let wanted: Vec<String> = specs.iter().map(|cols| index_name(name, cols)).collect();

        let prefix = format!("idx_{name}_");
        let existing = session
            .query_strings(
                "select name from sqlite_master where type = 'index' and tbl_name = ?",
                &[SqlValue::from(name)],
            )
            .await?;
        for index in existing {
            let ours = index.starts_with(&prefix)
                && index != format!("idx_{name}_autoDeleteDateTime")
                && index != format!("idx_{name}_arrayValues_keys");
            if ours && !wanted.contains(&index) {
                session
                    .execute(&format!("drop index if exists {}", quote_ident(&index)))
                    .await?;
            }
        }

        self.indexes.insert(name.to_string(), specs);
        if let Some(schema) = self.get(name) {
            self.create_indexes(session, collection, &schema).await?;
        }
        Ok(())
    }

    async fn create_indexes(
        &self,
        session: &mut Session,
        collection: &Collection,
        schema: &CollectionSchema,
    ) -> Result<()> {
        let Some(specs) = self
            .indexes
            .get(collection.as_str())
            .map(|entry| entry.value().clone())
        else {
            return Ok(());
        };

        for columns in specs {
            let ready = columns
                .iter()
                .all(|c| schema.is_queryable_column(c) || SYSTEM_COLUMNS.contains(&c.as_str()));
            if !ready {
                continue;
            }
            let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            let sql = format!(
                "create index if not exists {} on {} ({})",
                quote_ident(&index_name(collection.as_str(), &columns)),
                collection.table(),
                column_list.join(", ")
            );
            session.execute(&sql).await?;
        }
        Ok(())
    }
}

/// Parse `["a", "b,c"]` into `[["a"], ["b", "c"]]`.
pub(crate) fn parse_index_specs(specs: &[&str]) -> Result<Vec<Vec<String>>> {
    specs
        .iter()
        .map(|spec| {
            let columns: Vec<String> = spec
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if columns.is_empty()
                || columns
                    .iter()
                    .any(|c| !stow_engine::schema::is_identifier(c))
            {
                return Err(StoreError::from(stow_engine::Error::InvalidField(
                    spec.to_string(),
                )));
            }
            Ok(columns)
        })
        .collect()
}

fn index_name(collection: &str, columns: &[String]) -> String {
    format!("idx_{}_{}", collection, columns.join("_"))
}

/// Read a collection's shape from the catalog. `None` if the table is gone.
async fn load(session: &mut Session, collection: &Collection) -> Result<Option<CollectionSchema>> {
    let columns = session
        .query(&format!("pragma table_info({})", collection.table()))
        .await?;
    if columns.is_empty() {
        return Ok(None);
    }

    let mut schema = CollectionSchema::new();
    for column in &columns {
        // cid, name, type, notnull, dflt_value, pk
        let Some(name) = column.text(1) else { continue };
        if SYSTEM_COLUMNS.contains(&name) {
            continue;
        }
        let declared = column.text(2).unwrap_or_default();
        schema = schema.with_column(name, FieldType::from_sql_type(declared));
    }

    let manifest = session
        .query_strings(
            &format!("select arrayColumns from {ARRAY_COLUMNS_TABLE} where tableName = ?"),
            &[SqlValue::from(collection.as_str())],
        )
        .await?;
    let arrays = manifest
        .first()
        .map(|text| ArrayManifest::parse(text))
        .unwrap_or_default();

    Ok(Some(schema.with_arrays(arrays)))
}

async fn save_manifest(
    session: &mut Session,
    collection: &Collection,
    arrays: &ArrayManifest,
) -> Result<()> {
    let params = [SqlValue::from(collection.as_str())];
    session
        .execute_with(
            &format!("delete from {ARRAY_COLUMNS_TABLE} where tableName = ?"),
            &params,
        )
        .await?;
    if let Some(text) = arrays.format() {
        session
            .execute_with(
                &format!("insert into {ARRAY_COLUMNS_TABLE} (tableName, arrayColumns) values (?, ?)"),
                &[SqlValue::from(collection.as_str()), SqlValue::from(text)],
            )
            .await?;
    }
    Ok(())
}

/// Remove a collection's manifest row.
pub(crate) async fn clear_manifest(session: &mut Session, collection: &Collection) -> Result<()> {
    session
        .execute_with(
            &format!("delete from {ARRAY_COLUMNS_TABLE} where tableName = ?"),
            &[SqlValue::from(collection.as_str())],
        )
        .await?;
    Ok(())
}
