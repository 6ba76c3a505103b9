//! Schema and manifest sources, and manifest row normalization.

use crate::catalog::{ColumnKind, SchemaModel, TableDef};
use crate::error::Error;
use crate::value::{PrimaryKey, Row, Value};
use chrono::NaiveDate;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while turning manifest rows into table rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// A row lacks a primary key value.
    #[error("row {row} of '{table}' has no value for primary key column '{column}'")]
    MissingPrimaryKey {
        table: String,
        column: String,
        row: usize,
    },

    /// A value cannot be converted to its column's kind.
    #[error("cannot store '{value}' in {kind} column '{table}.{column}'")]
    InvalidValue {
        table: String,
        column: String,
        kind: ColumnKind,
        value: String,
    },
}

/// Errors raised by schema and manifest sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The requested schema or manifest does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Reading a source document failed.
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A source document is malformed.
    #[error("failed to parse '{path}': {reason}")]
    Parse { path: String, reason: String },

    /// Any other source failure.
    #[error("{0}")]
    Other(String),
}

/// Provides validated schemas by identifier.
pub trait SchemaSource {
    /// Fetch and validate the schema named `identifier`.
    fn fetch_schema(&self, identifier: &str) -> Result<SchemaModel, Error>;
}

/// Provides manifest rows for a table.
pub trait ManifestSource {
    /// Rows of every manifest for `table`, optionally only those newer than
    /// `since_version`. Rows may come in any order.
    fn fetch_rows(&self, table: &str, since_version: Option<u64>) -> Result<Vec<Row>, SourceError>;
}

/// Prepare manifest rows for upsert into `table`.
///
/// Columns the table does not declare are dropped, values are coerced to
/// their column kinds, and rows sharing a primary key collapse to the last
/// one.
pub fn normalize_rows(table: &TableDef, rows: Vec<Row>) -> Result<Vec<Row>, ManifestError> {
    let mut normalized = Vec::with_capacity(rows.len());
    for mut row in rows {
        let mut out = Row::new(table.name.clone());
        for column in &table.columns {
            let Some(value) = row.values.remove(&column.name) else {
                continue;
            };
            let coerced = coerce(&value, column.kind).ok_or_else(|| ManifestError::InvalidValue {
                table: table.name.clone(),
                column: column.name.clone(),
                kind: column.kind,
                value: value.to_string(),
            })?;
            out.set(column.name.clone(), coerced);
        }
        normalized.push(out);
    }

    let (rows, _) = dedupe_by_key(table, normalized)?;
    Ok(rows)
}

/// Collapse rows sharing a primary key to the last one.
///
/// Each surviving row keeps the position of the first row with its key.
/// Returns the rows and the number discarded.
pub(crate) fn dedupe_by_key(
    table: &TableDef,
    rows: Vec<Row>,
) -> Result<(Vec<Row>, usize), ManifestError> {
    if !table.has_primary_key() {
        return Ok((rows, 0));
    }

    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    let mut positions: HashMap<PrimaryKey, usize> = HashMap::new();
    let mut duplicates = 0;

    for (i, row) in rows.into_iter().enumerate() {
        let Some(key) = row.key(&table.primary_key) else {
            let column = table
                .primary_key
                .iter()
                .find(|c| row.get(c).map_or(true, Value::is_null))
                .cloned()
                .unwrap_or_default();
            return Err(ManifestError::MissingPrimaryKey {
                table: table.name.clone(),
                column,
                row: i,
            });
        };
        match positions.get(&key) {
            Some(&pos) => {
                out[pos] = row;
                duplicates += 1;
            }
            None => {
                positions.insert(key, out.len());
                out.push(row);
            }
        }
    }
    Ok((out, duplicates))
}

/// Convert a value to a column kind. `None` means the value does not fit.
fn coerce(value: &Value, kind: ColumnKind) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }
    if !kind.is_text() && value.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Some(Value::Null);
    }

    match kind {
        ColumnKind::String | ColumnKind::LargeText => match value {
            Value::String(_) => Some(value.clone()),
            other => Some(Value::String(other.to_string())),
        },
        ColumnKind::Integer => match value {
            Value::Int(_) => Some(value.clone()),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Some(Value::Int(*f as i64))
            }
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::Int),
            _ => None,
        },
        ColumnKind::Float => match value {
            Value::Float(_) => Some(value.clone()),
            Value::Int(i) => Some(Value::Float(*i as f64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(Value::Float),
            _ => None,
        },
        ColumnKind::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Int(0) => Some(Value::Bool(false)),
            Value::Int(1) => Some(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ColumnKind::Date => match value {
            Value::Date(_) => Some(value.clone()),
            Value::String(s) => parse_date(s.trim()).map(Value::Date),
            _ => None,
        },
    }
}

/// Parse `YYYY-MM-DD`, also accepting a timestamp with that prefix.
fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| s.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}
