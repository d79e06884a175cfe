//! Documents and their encoding.
//!
//! A document is a flat JSON object. Encoding classifies each field into a
//! [`FieldValue`]; the store then writes scalars to columns and arrays to the
//! side table.

use crate::{
    error::Result,
    schema::{self, ArrayManifest, ADDED_COLUMN, AUTO_DELETE_COLUMN, KEY_COLUMN, UPDATED_COLUMN},
    timestamp::Timestamp,
    value::FieldValue,
    Error,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A keyed document with typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    key: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// Create an empty document.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(Self {
            key,
            fields: BTreeMap::new(),
        })
    }

    /// Add or replace a field.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Result<Self> {
        let name = name.into();
        schema::validate_field_name(&name)?;
        self.fields.insert(name, value);
        Ok(self)
    }

    /// Encode a JSON value, which must be an object.
    ///
    /// A `key` field inside the object is ignored; the explicit key wins.
    /// `null` fields are treated as absent.
    pub fn from_json(key: impl Into<String>, value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("document must be a JSON object".into()))?;
        Self::from_map(key, object)
    }

    /// Encode JSON text, which must hold an object.
    pub fn from_json_str(key: impl Into<String>, text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        Self::from_json(key, &value)
    }

    pub fn from_map(key: impl Into<String>, object: &Map<String, Value>) -> Result<Self> {
        let mut document = Self::new(key)?;
        for (name, value) in object {
            if name == KEY_COLUMN {
                continue;
            }
            schema::validate_field_name(name)?;
            if let Some(field) = FieldValue::from_json(name, value)? {
                document.fields.insert(name.clone(), field);
            }
        }
        Ok(document)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn fields_mut(&mut self) -> impl Iterator<Item = (&String, &mut FieldValue)> {
        self.fields.iter_mut()
    }

    /// Fields stored as columns of the main table.
    pub fn scalars(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields().filter(|(_, v)| !v.is_array())
    }

    /// Fields stored in the side table.
    pub fn arrays(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields().filter(|(_, v)| v.is_array())
    }

    /// The manifest of this document's own array fields.
    pub fn array_manifest(&self) -> ArrayManifest {
        let mut manifest = ArrayManifest::new();
        for (name, value) in self.arrays() {
            manifest.insert(name, value.field_type());
        }
        manifest
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The document as a flat JSON object, without its key.
    pub fn to_json(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }

    pub(crate) fn insert(&mut self, name: String, value: FieldValue) {
        self.fields.insert(name, value);
    }
}

/// A document as read back from storage, with its system timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    pub added: Option<Timestamp>,
    pub updated: Option<Timestamp>,
    pub auto_delete: Option<Timestamp>,
}

impl StoredDocument {
    /// Rebuild a stored document from decoded parts.
    pub fn from_parts(key: impl Into<String>, fields: Vec<(String, FieldValue)>) -> Result<Self> {
        let mut document = Document::new(key)?;
        for (name, value) in fields {
            document.insert(name, value);
        }
        Ok(Self {
            document,
            added: None,
            updated: None,
            auto_delete: None,
        })
    }

    /// The value carried by a `U` entry of a sync file: the document fields
    /// plus the system timestamps.
    pub fn to_sync_value(&self) -> Map<String, Value> {
        let mut value = self.document.to_json();
        let dates = [
            (ADDED_COLUMN, self.added),
            (UPDATED_COLUMN, self.updated),
            (AUTO_DELETE_COLUMN, self.auto_delete),
        ];
        for (column, ts) in dates {
            if let Some(ts) = ts {
                value.insert(column.to_string(), Value::String(ts.to_canonical()));
            }
        }
        value
    }

    /// Split the value of an incoming `U` entry into document and timestamps.
    pub fn from_sync_value(key: impl Into<String>, value: &Map<String, Value>) -> Result<Self> {
        let mut fields = value.clone();
        let added = take_timestamp(&mut fields, ADDED_COLUMN)?;
        let updated = take_timestamp(&mut fields, UPDATED_COLUMN)?;
        let auto_delete = take_timestamp(&mut fields, AUTO_DELETE_COLUMN)?;
        Ok(Self {
            document: Document::from_map(key, &fields)?,
            added,
            updated,
            auto_delete,
        })
    }
}

fn take_timestamp(fields: &mut Map<String, Value>, column: &str) -> Result<Option<Timestamp>> {
    match fields.remove(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Timestamp::parse(&text).map(Some),
        Some(other) => Err(Error::InvalidTimestamp(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldType;
    use serde_json::json;

    #[test]
    fn encodes_fields_and_ignores_key() {
        let doc = Document::from_json(
            "p1",
            &json!({"key": "other", "name": "Ann", "age": 31, "tags": ["a", "b"], "gone": null}),
        )
        .unwrap();
        assert_eq!(doc.key(), "p1");
        assert_eq!(doc.len(), 3);
        assert_eq!(doc.scalars().count(), 2);
        assert_eq!(doc.arrays().count(), 1);
        assert_eq!(doc.array_manifest().get("tags"), Some(FieldType::TextArray));
        assert!(doc.get("gone").is_none());
    }

    #[test]
    fn contract_violations() {
        assert_eq!(
            Document::from_json("", &json!({})),
            Err(Error::EmptyKey)
        );
        assert!(matches!(
            Document::from_json("k", &json!([1, 2])),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            Document::from_json_str("k", "{not json"),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            Document::from_json("k", &json!({"updatedDateTime": "x"})),
            Err(Error::ReservedField(_))
        ));
        assert!(matches!(
            Document::from_json("k", &json!({"bad name": 1})),
            Err(Error::InvalidField(_))
        ));
    }

    #[test]
    fn to_json_drops_key() {
        let doc = Document::from_json("p1", &json!({"a": 1, "b": [2.5]})).unwrap();
        assert_eq!(
            Value::Object(doc.to_json()),
            json!({"a": 1, "b": [2.5]})
        );
    }

    #[test]
    fn sync_value_carries_dates() {
        let added = Timestamp::from_millis(1_000).unwrap();
        let stored = StoredDocument {
            document: Document::from_json("p1", &json!({"a": 1})).unwrap(),
            added: Some(added),
            updated: Some(added),
            auto_delete: None,
        };
        let value = stored.to_sync_value();
        assert_eq!(value["addedDateTime"], json!("1970-01-01T00:00:01.000+00:00"));
        assert!(!value.contains_key("autoDeleteDateTime"));

        let back = StoredDocument::from_sync_value("p1", &value).unwrap();
        assert_eq!(back, stored);
    }

    #[test]
    fn sync_value_rejects_bad_dates() {
        let value = json!({"a": 1, "autoDeleteDateTime": "soon"});
        assert!(StoredDocument::from_sync_value("p1", value.as_object().unwrap()).is_err());
    }
}
