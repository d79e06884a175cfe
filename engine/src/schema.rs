//! Collection naming rules and per-collection schema.
//!
//! A collection owns two tables: the main table, with one column per scalar
//! field, and the side table `<name>_arrayValues`, with one row per array
//! element. Which fields are arrays is recorded in an array manifest, a
//! comma-joined list of `field:type` tokens.

use crate::{
    document::Document,
    error::Result,
    value::{FieldType, FieldValue},
    Error,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix marking internal metadata tables.
pub const RESERVED_PREFIX: &str = "__";
/// Suffix of every collection's side table.
pub const ARRAY_TABLE_SUFFIX: &str = "_arrayValues";

pub const KEY_COLUMN: &str = "key";
pub const ADDED_COLUMN: &str = "addedDateTime";
pub const UPDATED_COLUMN: &str = "updatedDateTime";
pub const AUTO_DELETE_COLUMN: &str = "autoDeleteDateTime";
pub const MANIFEST_COLUMN: &str = "hasArrayValues";

/// Column names a document field may never use.
pub const SYSTEM_COLUMNS: [&str; 6] = [
    KEY_COLUMN,
    ADDED_COLUMN,
    UPDATED_COLUMN,
    AUTO_DELETE_COLUMN,
    MANIFEST_COLUMN,
    "arrayValues",
];

/// Whether `name` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether a catalog table name belongs to the store itself.
pub fn is_reserved_table(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || name.to_ascii_lowercase().starts_with("sqlite_")
}

/// Whether a catalog table name is a user collection's main table.
pub fn is_collection_table(name: &str) -> bool {
    !is_reserved_table(name) && !name.ends_with(ARRAY_TABLE_SUFFIX) && is_identifier(name)
}

/// Quote an identifier for SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for SQL.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Check a document field name.
pub fn validate_field_name(name: &str) -> Result<()> {
    if !is_identifier(name) {
        return Err(Error::InvalidField(name.to_string()));
    }
    if SYSTEM_COLUMNS.contains(&name) {
        return Err(Error::ReservedField(name.to_string()));
    }
    Ok(())
}

/// A validated collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Collection(String);

impl Collection {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_identifier(&name) || !is_collection_table(&name) {
            return Err(Error::InvalidCollection(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted main table name.
    pub fn table(&self) -> String {
        quote_ident(&self.0)
    }

    /// Quoted side table name.
    pub fn array_table(&self) -> String {
        quote_ident(&format!("{}{}", self.0, ARRAY_TABLE_SUFFIX))
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Collection {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Collection::new(value)
    }
}

impl From<Collection> for String {
    fn from(value: Collection) -> Self {
        value.0
    }
}

impl AsRef<str> for Collection {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which fields of a collection (or a single document) hold arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrayManifest {
    fields: BTreeMap<String, FieldType>,
}

impl ArrayManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `field:type,field:type` list. Unknown tokens are skipped.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .split(',')
            .filter_map(|token| {
                let (field, ty) = token.trim().split_once(':')?;
                let ty = FieldType::from_manifest_token(ty.trim())?;
                Some((field.trim().to_string(), ty))
            })
            .filter(|(field, _)| !field.is_empty())
            .collect();
        Self { fields }
    }

    /// Format as a `field:type` list; `None` when there are no arrays.
    pub fn format(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }
        let tokens: Vec<String> = self
            .fields
            .iter()
            .filter_map(|(field, ty)| Some(format!("{}:{}", field, ty.manifest_token()?)))
            .collect();
        Some(tokens.join(","))
    }

    pub fn get(&self, field: &str) -> Option<FieldType> {
        self.fields.get(field).copied()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, ty: FieldType) {
        if ty.is_array() {
            self.fields.insert(field.into(), ty);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(f, t)| (f.as_str(), *t))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Column and manifest changes needed before a document can be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaChanges {
    /// Scalar columns to add, in field order.
    pub new_columns: Vec<(String, FieldType)>,
    /// Array fields to append to the collection manifest.
    pub new_arrays: Vec<(String, FieldType)>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.new_columns.is_empty() && self.new_arrays.is_empty()
    }
}

/// Known shape of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSchema {
    columns: BTreeMap<String, FieldType>,
    arrays: ArrayManifest,
}

impl CollectionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.columns.insert(name.into(), ty);
        self
    }

    pub fn with_arrays(mut self, arrays: ArrayManifest) -> Self {
        self.arrays = arrays;
        self
    }

    /// Scalar user columns, in name order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.columns.iter().map(|(c, t)| (c.as_str(), *t))
    }

    pub fn column_type(&self, field: &str) -> Option<FieldType> {
        self.columns.get(field).copied()
    }

    /// Whether `field` can appear in a validated condition.
    pub fn is_queryable_column(&self, field: &str) -> bool {
        field == KEY_COLUMN || self.columns.contains_key(field)
    }

    pub fn arrays(&self) -> &ArrayManifest {
        &self.arrays
    }

    /// Check a document against this schema and compute what must be added.
    ///
    /// Values are widened in place where the established type allows it,
    /// and empty arrays adopt the established array type.
    pub fn conform(&self, document: &mut Document) -> Result<SchemaChanges> {
        let mut changes = SchemaChanges::default();

        for (field, value) in document.fields_mut() {
            let incoming = value.field_type();
            let established = if incoming.is_array() {
                if self.columns.contains_key(field.as_str()) {
                    return Err(mismatch(field, self.columns[field.as_str()], incoming));
                }
                self.arrays.get(field)
            } else {
                if self.arrays.contains(field) {
                    return Err(mismatch(field, self.arrays.get(field), incoming));
                }
                self.column_type(field)
            };

            match established {
                Some(ty) if value.is_empty_array() => {
                    let widened = std::mem::replace(value, FieldValue::TextArray(Vec::new()));
                    *value = widened.widen_to(ty);
                }
                Some(ty) if ty.accepts(incoming) => {
                    let widened = std::mem::replace(value, FieldValue::Bool(false));
                    *value = widened.widen_to(ty);
                }
                Some(ty) => return Err(mismatch(field, ty, incoming)),
                None if incoming.is_array() => changes.new_arrays.push((field.clone(), incoming)),
                None => changes.new_columns.push((field.clone(), incoming)),
            }
        }

        Ok(changes)
    }

    /// Record changes once they have been applied to storage.
    pub fn apply(&mut self, changes: &SchemaChanges) {
        for (name, ty) in &changes.new_columns {
            self.columns.insert(name.clone(), *ty);
        }
        for (name, ty) in &changes.new_arrays {
            self.arrays.insert(name.clone(), *ty);
        }
    }
}

fn mismatch(field: &str, expected: impl Into<Option<FieldType>>, got: FieldType) -> Error {
    let expected = expected
        .into()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "array".to_string());
    Error::TypeMismatch {
        field: field.to_string(),
        expected,
        got: got.to_string(),
    }
}
