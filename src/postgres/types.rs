use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One row returned by `pg_logical_slot_peek_changes`: a decoded change-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub lsn: String,
    pub xid: String,
    pub data: String,
}

/// A column value as text plus the SQL type the plugin declared for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDatum {
    /// `None` is SQL NULL.
    pub value: Option<String>,
    pub type_name: String,
}

impl ColumnDatum {
    pub fn new(value: Option<String>, type_name: impl Into<String>) -> Self {
        Self {
            value,
            type_name: type_name.into(),
        }
    }

    pub fn text(value: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(Some(value.into()), type_name)
    }

    pub fn null(type_name: impl Into<String>) -> Self {
        Self::new(None, type_name)
    }

    /// Renders the datum for a diff or primary key: numeric types become
    /// JSON numbers when their text parses, NULL becomes `null`.
    pub fn to_json(&self) -> Value {
        match &self.value {
            None => Value::Null,
            Some(text) if is_numeric_type(&self.type_name) => {
                numeric_json(text).unwrap_or_else(|| Value::String(text.clone()))
            }
            Some(text) => Value::String(text.clone()),
        }
    }
}

/// Numbers that survive the trip through JSON unchanged; `None` keeps the
/// text, e.g. a `numeric(40,0)` key wider than `u64`.
fn numeric_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(Value::from(int));
    }
    if let Ok(int) = trimmed.parse::<u64>() {
        return Some(Value::from(int));
    }
    if significant_digits(trimmed) > f64::DIGITS as usize {
        return None;
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// Significant decimal digits of a number in text form.
pub(crate) fn significant_digits(text: &str) -> usize {
    let mantissa = text.split(|c| c == 'e' || c == 'E').next().unwrap_or_default();
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    digits.trim_start_matches('0').trim_end_matches('0').len()
}

/// Whether a declared SQL type renders as a JSON number.
pub fn is_numeric_type(type_name: &str) -> bool {
    let base = type_name
        .split('(')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    matches!(
        base.as_str(),
        "smallint"
            | "integer"
            | "int"
            | "bigint"
            | "int2"
            | "int4"
            | "int8"
            | "smallserial"
            | "serial"
            | "bigserial"
            | "serial2"
            | "serial4"
            | "serial8"
            | "numeric"
            | "decimal"
            | "real"
            | "float4"
            | "float8"
            | "double precision"
            | "oid"
    )
}

/// Column name to datum, in the order the plugin emitted the columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnImage {
    columns: Vec<(String, ColumnDatum)>,
}

impl ColumnImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a column, replacing the datum if the name is already present.
    pub fn insert(&mut self, name: impl Into<String>, datum: ColumnDatum) {
        let name = name.into();
        match self.columns.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = datum,
            None => self.columns.push((name, datum)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDatum> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, datum)| datum)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnDatum)> {
        self.columns.iter().map(|(name, datum)| (name.as_str(), datum))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub old_value: Value,
    pub new_value: Value,
}

pub type Diff = BTreeMap<String, DiffEntry>;

pub type PrimaryKey = BTreeMap<String, Value>;

/// The normalized unit handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub diff: Diff,
    pub primary_key: PrimaryKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u64>,
    pub captured_at: DateTime<Utc>,
}

impl ChangeMessage {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}
