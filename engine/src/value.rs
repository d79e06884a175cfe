//! Field values and their storage types.
//!
//! Every document field is classified into one of seven storage types. Scalars
//! live in a column of the collection's main table; arrays live in the
//! collection's side table, one row per element.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Storage type of a document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Int,
    Double,
    Bool,
    TextArray,
    IntArray,
    DoubleArray,
}

impl FieldType {
    /// Whether values of this type are stored in the side table.
    pub fn is_array(self) -> bool {
        matches!(
            self,
            FieldType::TextArray | FieldType::IntArray | FieldType::DoubleArray
        )
    }

    /// Declared column type used when adding a scalar column.
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Text | FieldType::TextArray => "text",
            FieldType::Int | FieldType::IntArray => "int",
            FieldType::Double | FieldType::DoubleArray => "double",
            FieldType::Bool => "bool",
        }
    }

    /// Map a declared column type back to a scalar field type.
    ///
    /// Unknown declarations are treated as text, which is how SQLite itself
    /// treats columns it cannot classify.
    pub fn from_sql_type(declared: &str) -> FieldType {
        match declared.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" | "bigint" => FieldType::Int,
            "double" | "real" | "float" => FieldType::Double,
            "bool" | "boolean" => FieldType::Bool,
            _ => FieldType::Text,
        }
    }

    /// Token recorded in an array manifest.
    pub fn manifest_token(self) -> Option<&'static str> {
        match self {
            FieldType::TextArray => Some("stringArray"),
            FieldType::IntArray => Some("intArray"),
            FieldType::DoubleArray => Some("doubleArray"),
            _ => None,
        }
    }

    pub fn from_manifest_token(token: &str) -> Option<FieldType> {
        match token {
            "stringArray" => Some(FieldType::TextArray),
            "intArray" => Some(FieldType::IntArray),
            "doubleArray" => Some(FieldType::DoubleArray),
            _ => None,
        }
    }

    /// Side-table column holding elements of this array type.
    pub fn element_column(self) -> Option<&'static str> {
        match self {
            FieldType::TextArray => Some("stringValue"),
            FieldType::IntArray => Some("intValue"),
            FieldType::DoubleArray => Some("doubleValue"),
            _ => None,
        }
    }

    /// Whether a field established as `self` may store a value of type `incoming`.
    ///
    /// Types are fixed once established. The only widening allowed is an
    /// integer into a double column (or integer elements into a double array).
    pub fn accepts(self, incoming: FieldType) -> bool {
        self == incoming
            || matches!(
                (self, incoming),
                (FieldType::Double, FieldType::Int) | (FieldType::DoubleArray, FieldType::IntArray)
            )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Text => write!(f, "text"),
            FieldType::Int => write!(f, "int"),
            FieldType::Double => write!(f, "double"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::TextArray => write!(f, "text[]"),
            FieldType::IntArray => write!(f, "int[]"),
            FieldType::DoubleArray => write!(f, "double[]"),
        }
    }
}

/// A typed document field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::TextArray(_) => FieldType::TextArray,
            FieldValue::IntArray(_) => FieldType::IntArray,
            FieldValue::DoubleArray(_) => FieldType::DoubleArray,
        }
    }

    pub fn is_array(&self) -> bool {
        self.field_type().is_array()
    }

    /// Classify a JSON value.
    ///
    /// Returns `Ok(None)` for `null`, which is treated as an absent field.
    /// Nested objects and arrays that are not homogeneous text or numbers are
    /// rejected. An empty array classifies as a text array; the schema layer
    /// retypes it to the collection's established array type.
    pub fn from_json(field: &str, value: &Value) -> Result<Option<FieldValue>> {
        let classified = match value {
            Value::Null => return Ok(None),
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Number(n) => number_value(field, n)?,
            Value::Array(items) => array_value(field, items)?,
            Value::Object(_) => {
                return Err(unsupported(
                    field,
                    "nested objects must be serialized before storing",
                ))
            }
        };
        Ok(Some(classified))
    }

    /// Convert back into JSON.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Double(d) => float_json(*d),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::TextArray(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            FieldValue::IntArray(items) => Value::Array(items.iter().map(|i| Value::from(*i)).collect()),
            FieldValue::DoubleArray(items) => Value::Array(items.iter().map(|d| float_json(*d)).collect()),
        }
    }

    /// Convert this value into the representation of `target`.
    ///
    /// Callers check [`FieldType::accepts`] first; anything else is returned
    /// unchanged.
    pub fn widen_to(self, target: FieldType) -> FieldValue {
        match (self, target) {
            (FieldValue::Int(i), FieldType::Double) => FieldValue::Double(i as f64),
            (FieldValue::IntArray(items), FieldType::DoubleArray) => {
                FieldValue::DoubleArray(items.into_iter().map(|i| i as f64).collect())
            }
            (FieldValue::TextArray(items), FieldType::IntArray) if items.is_empty() => {
                FieldValue::IntArray(Vec::new())
            }
            (FieldValue::TextArray(items), FieldType::DoubleArray) if items.is_empty() => {
                FieldValue::DoubleArray(Vec::new())
            }
            (value, _) => value,
        }
    }

    /// Whether this is an array with no elements.
    pub fn is_empty_array(&self) -> bool {
        match self {
            FieldValue::TextArray(items) => items.is_empty(),
            FieldValue::IntArray(items) => items.is_empty(),
            FieldValue::DoubleArray(items) => items.is_empty(),
            _ => false,
        }
    }
}

fn unsupported(field: &str, reason: &str) -> Error {
    Error::UnsupportedValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn number_value(field: &str, n: &Number) -> Result<FieldValue> {
    if let Some(i) = n.as_i64() {
        return Ok(FieldValue::Int(i));
    }
    match n.as_f64() {
        Some(d) if d.is_finite() => Ok(FieldValue::Double(d)),
        _ => Err(unsupported(field, "number is out of range")),
    }
}

fn array_value(field: &str, items: &[Value]) -> Result<FieldValue> {
    let Some(first) = items.first() else {
        return Ok(FieldValue::TextArray(Vec::new()));
    };

    match first {
        Value::String(_) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(unsupported(field, "array elements must share one type")),
            })
            .collect::<Result<Vec<_>>>()
            .map(FieldValue::TextArray),
        Value::Number(_) => {
            let mut ints = Vec::with_capacity(items.len());
            let mut all_int = true;
            for item in items {
                let Value::Number(n) = item else {
                    return Err(unsupported(field, "array elements must share one type"));
                };
                match n.as_i64() {
                    Some(i) if all_int => ints.push(i),
                    _ => all_int = false,
                }
            }
            if all_int {
                return Ok(FieldValue::IntArray(ints));
            }
            items
                .iter()
                .map(|item| match item {
                    Value::Number(n) => match n.as_f64() {
                        Some(d) if d.is_finite() => Ok(d),
                        _ => Err(unsupported(field, "number is out of range")),
                    },
                    _ => Err(unsupported(field, "array elements must share one type")),
                })
                .collect::<Result<Vec<_>>>()
                .map(FieldValue::DoubleArray)
        }
        _ => Err(unsupported(
            field,
            "only arrays of text, integers or doubles are supported",
        )),
    }
}

fn float_json(d: f64) -> Value {
    Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)
}
