//! Condition sets and the key query compiler.
//!
//! Conditions sharing a `set` number are ANDed; sets are ORed together. A
//! query with no conditions matches every document of the collection.
//!
//! # Rendering
//!
//! - comparisons render as column comparisons with a literal formatted by the
//!   value's type (text quoted, dates in canonical form, booleans as 0/1)
//! - `contains` on a scalar column renders as `like '%value%'`
//! - `contains` on an array field matches a side-table row for that field and
//!   the element value
//! - `in` renders as an `in (...)` list; an empty list matches nothing
//! - a field the collection has never stored renders as `NULL`, so any
//!   comparison against it matches nothing
//!
//! The sort spec is appended verbatim and must come from trusted code.

use crate::{
    error::Result,
    schema::{quote_ident, quote_literal, Collection, CollectionSchema, KEY_COLUMN},
    timestamp::Timestamp,
    value::FieldType,
    Error,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Contains,
    InList,
}

impl Operator {
    fn comparison(self) -> Option<&'static str> {
        match self {
            Operator::Equal => Some("="),
            Operator::NotEqual => Some("<>"),
            Operator::Less => Some("<"),
            Operator::Greater => Some(">"),
            Operator::LessOrEqual => Some("<="),
            Operator::GreaterOrEqual => Some(">="),
            Operator::Contains | Operator::InList => None,
        }
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum ConditionValue {
    Text(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Date(Timestamp),
    TextList(Vec<String>),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
}

impl ConditionValue {
    fn is_list(&self) -> bool {
        matches!(
            self,
            ConditionValue::TextList(_) | ConditionValue::IntList(_) | ConditionValue::DoubleList(_)
        )
    }

    /// Render a scalar value as a SQL literal.
    fn literal(&self, field: &str) -> Result<String> {
        match self {
            ConditionValue::Text(s) => Ok(quote_literal(s)),
            ConditionValue::Int(i) => Ok(i.to_string()),
            ConditionValue::Double(d) => float_literal(field, *d),
            ConditionValue::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
            ConditionValue::Date(ts) => Ok(quote_literal(&ts.to_canonical())),
            _ => Err(invalid(field, "a list value needs the in-list operator")),
        }
    }

    /// Render a list value as the body of an `in (...)` clause.
    fn list_literals(&self, field: &str) -> Result<Vec<String>> {
        match self {
            ConditionValue::TextList(items) => Ok(items.iter().map(|s| quote_literal(s)).collect()),
            ConditionValue::IntList(items) => Ok(items.iter().map(|i| i.to_string()).collect()),
            ConditionValue::DoubleList(items) => {
                items.iter().map(|d| float_literal(field, *d)).collect()
            }
            _ => Err(invalid(field, "in-list needs a list value")),
        }
    }

    /// The text searched for by a substring `contains`.
    fn search_text(&self, field: &str) -> Result<String> {
        match self {
            ConditionValue::Text(s) => Ok(s.clone()),
            ConditionValue::Int(i) => Ok(i.to_string()),
            ConditionValue::Double(d) => float_literal(field, *d),
            ConditionValue::Date(ts) => Ok(ts.to_canonical()),
            _ => Err(invalid(field, "contains needs a text or number value")),
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        ConditionValue::Text(value.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(value: String) -> Self {
        ConditionValue::Text(value)
    }
}

impl From<i64> for ConditionValue {
    fn from(value: i64) -> Self {
        ConditionValue::Int(value)
    }
}

impl From<i32> for ConditionValue {
    fn from(value: i32) -> Self {
        ConditionValue::Int(value.into())
    }
}

impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        ConditionValue::Double(value)
    }
}

impl From<bool> for ConditionValue {
    fn from(value: bool) -> Self {
        ConditionValue::Bool(value)
    }
}

impl From<Timestamp> for ConditionValue {
    fn from(value: Timestamp) -> Self {
        ConditionValue::Date(value)
    }
}

impl From<Vec<String>> for ConditionValue {
    fn from(value: Vec<String>) -> Self {
        ConditionValue::TextList(value)
    }
}

impl From<Vec<&str>> for ConditionValue {
    fn from(value: Vec<&str>) -> Self {
        ConditionValue::TextList(value.into_iter().map(String::from).collect())
    }
}

impl From<Vec<i64>> for ConditionValue {
    fn from(value: Vec<i64>) -> Self {
        ConditionValue::IntList(value)
    }
}

impl From<Vec<f64>> for ConditionValue {
    fn from(value: Vec<f64>) -> Self {
        ConditionValue::DoubleList(value)
    }
}

/// One predicate of a condition set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Conditions with the same set are ANDed; sets are ORed.
    pub set: u32,
    pub field: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

impl Condition {
    pub fn new(
        set: u32,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        Self {
            set,
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Result of compiling a key query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledQuery {
    /// SQL selecting the matching keys in one column.
    Sql(String),
    /// Validation removed every condition set; nothing can match.
    NoMatch,
}

/// A key query: optional sort plus condition sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyQuery {
    /// `order by` body, e.g. `"age desc, name"`.
    pub sort: Option<String>,
    pub conditions: Vec<Condition>,
    /// Drop every set that references a field which is not a scalar column.
    pub validate: bool,
}

impl KeyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Shorthand for a condition in set 0.
    pub fn filter(
        self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        self.condition(Condition::new(0, field, operator, value))
    }

    pub fn validated(mut self) -> Self {
        self.validate = true;
        self
    }

    /// Compile against the known shape of `collection`.
    pub fn compile(
        &self,
        collection: &Collection,
        schema: &CollectionSchema,
    ) -> Result<CompiledQuery> {
        let mut sets: BTreeMap<u32, Vec<&Condition>> = BTreeMap::new();
        for condition in &self.conditions {
            sets.entry(condition.set).or_default().push(condition);
        }

        if self.validate {
            sets.retain(|_, members| {
                members
                    .iter()
                    .all(|c| schema.is_queryable_column(&c.field))
            });
            if sets.is_empty() && !self.conditions.is_empty() {
                return Ok(CompiledQuery::NoMatch);
            }
        }

        let mut sql = format!("select {} from {}", quote_ident(KEY_COLUMN), collection.table());

        if !sets.is_empty() {
            let clauses = sets
                .values()
                .map(|members| {
                    let predicates = members
                        .iter()
                        .map(|c| render_condition(c, collection, schema))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(format!("({})", predicates.join(" and ")))
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" where 1=1 and (\n");
            sql.push_str(&clauses.join("\nor "));
            sql.push_str("\n)");
        }

        if let Some(sort) = self.sort.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(" order by ");
            sql.push_str(sort);
        }

        Ok(CompiledQuery::Sql(sql))
    }
}

fn render_condition(
    condition: &Condition,
    collection: &Collection,
    schema: &CollectionSchema,
) -> Result<String> {
    let field = condition.field.as_str();

    if let Some(element) = schema.arrays().get(field) {
        return render_array_condition(condition, collection, element);
    }

    let column = if schema.is_queryable_column(field) {
        quote_ident(field)
    } else {
        "NULL".to_string()
    };

    match condition.operator {
        Operator::Contains => {
            let needle = condition.value.search_text(field)?;
            Ok(format!(
                "{} like {} escape '\\'",
                column,
                quote_literal(&format!("%{}%", escape_like(&needle)))
            ))
        }
        Operator::InList => {
            let items = condition.value.list_literals(field)?;
            if items.is_empty() {
                return Ok("0".to_string());
            }
            Ok(format!("{} in ({})", column, items.join(",")))
        }
        op => {
            let symbol = op.comparison().unwrap_or("=");
            if condition.value.is_list() {
                return Err(invalid(field, "a list value needs the in-list operator"));
            }
            Ok(format!("{} {} {}", column, symbol, condition.value.literal(field)?))
        }
    }
}

/// Array fields only support `contains`: the document must own a side-table
/// row for the field whose typed value equals the literal.
fn render_array_condition(
    condition: &Condition,
    collection: &Collection,
    element: FieldType,
) -> Result<String> {
    let field = condition.field.as_str();
    if condition.operator != Operator::Contains {
        return Err(invalid(field, "array fields only support contains"));
    }
    let literal = match (&condition.value, element) {
        (ConditionValue::Bool(_), _) | (ConditionValue::Date(_), FieldType::IntArray) => {
            return Err(invalid(field, "value cannot match an array element"))
        }
        (value, _) => value.literal(field)?,
    };
    let column = element
        .element_column()
        .ok_or_else(|| invalid(field, "not an array field"))?;
    Ok(format!(
        "{key} in (select {key} from {side} where {object_key} = {name} and {column} = {literal})",
        key = quote_ident(KEY_COLUMN),
        side = collection.array_table(),
        object_key = quote_ident("objectKey"),
        name = quote_literal(field),
        column = quote_ident(column),
        literal = literal,
    ))
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn float_literal(field: &str, value: f64) -> Result<String> {
    if !value.is_finite() {
        return Err(invalid(field, "number must be finite"));
    }
    Ok(format!("{:?}", value))
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::InvalidCondition {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
