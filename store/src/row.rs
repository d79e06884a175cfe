//! Dynamically typed SQL values and rows.
//!
//! Collections gain columns at runtime, so rows are read by storage class
//! rather than through compile-time `FromRow` mappings.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, TypeInfo, ValueRef};
use stow_engine::{FieldType, FieldValue, Timestamp};

/// A value as SQLite stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Real(d) if d.fract() == 0.0 => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::Real(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Parse a canonical timestamp column.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        self.as_text().and_then(|text| Timestamp::parse(text).ok())
    }

    /// Decode a scalar column of the given field type.
    pub fn to_field(&self, ty: FieldType) -> Option<FieldValue> {
        match ty {
            FieldType::Text => match self {
                SqlValue::Text(s) => Some(FieldValue::Text(s.clone())),
                SqlValue::Integer(i) => Some(FieldValue::Text(i.to_string())),
                SqlValue::Real(d) => Some(FieldValue::Text(d.to_string())),
                SqlValue::Null => None,
            },
            FieldType::Int => self.as_i64().map(FieldValue::Int),
            FieldType::Double => self.as_f64().map(FieldValue::Double),
            FieldType::Bool => self.as_i64().map(|i| FieldValue::Bool(i != 0)),
            _ => None,
        }
    }
}

impl From<&FieldValue> for SqlValue {
    /// Scalars only; arrays live in the side table and bind as NULL here.
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => SqlValue::Text(s.clone()),
            FieldValue::Int(i) => SqlValue::Integer(*i),
            FieldValue::Double(d) => SqlValue::Real(*d),
            FieldValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
            _ => SqlValue::Null,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<Timestamp> for SqlValue {
    fn from(value: Timestamp) -> Self {
        SqlValue::Text(value.to_canonical())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn get(&self, index: usize) -> &SqlValue {
        self.values.get(index).unwrap_or(&SqlValue::Null)
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        self.get(index).as_text()
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        self.get(index).as_i64()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let mut values = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                values.push(SqlValue::Null);
                continue;
            }
            let storage_class = raw.type_info().name().to_string();
            let value = match storage_class.as_str() {
                "INTEGER" => SqlValue::Integer(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" => SqlValue::Real(row.try_get_unchecked::<f64, _>(index)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get_unchecked(index)?;
                    SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => SqlValue::Text(row.try_get_unchecked::<String, _>(index)?),
            };
            values.push(value);
        }
        Ok(Self { values })
    }
}
