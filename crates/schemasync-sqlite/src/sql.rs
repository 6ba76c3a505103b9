//! SQL text generation and value conversion.

use chrono::NaiveDate;
use rusqlite::types::{Value as SqlValue, ValueRef};
use schemasync_core::{ColumnKind, Row, TableDef, Value};

/// Quote an identifier for SQLite.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::String | ColumnKind::LargeText | ColumnKind::Date => "TEXT",
        ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
        ColumnKind::Float => "REAL",
    }
}

/// `CREATE TABLE IF NOT EXISTS` for a table.
///
/// `skip_fk` lists foreign-key source columns that get no FOREIGN KEY clause.
pub fn create_table(table: &TableDef, skip_fk: &[&str]) -> String {
    let mut parts: Vec<String> = table
        .ordered_columns()
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote(&c.name), column_type(c.kind));
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();

    if table.has_primary_key() {
        parts.push(format!("PRIMARY KEY ({})", quoted_list(&table.primary_key)));
    }
    for relation in &table.relations {
        if skip_fk.contains(&relation.from_column.as_str()) {
            continue;
        }
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            quote(&relation.from_column),
            quote(&relation.to_table),
            quote(&relation.to_column)
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&table.name),
        parts.join(", ")
    )
}

/// `CREATE INDEX IF NOT EXISTS` statements for indexed columns.
pub fn create_indexes(table: &TableDef) -> Vec<String> {
    table
        .columns
        .iter()
        .filter(|c| c.indexed)
        .map(|c| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("idx_{}_{}", table.name, c.name)),
                quote(&table.name),
                quote(&c.name)
            )
        })
        .collect()
}

/// Insert-or-replace-by-key statement binding every column in order.
pub fn upsert(table: &TableDef) -> String {
    let columns: Vec<String> = table
        .ordered_columns()
        .iter()
        .map(|c| c.name.clone())
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(&table.name),
        quoted_list(&columns),
        placeholders.join(", ")
    );

    if !table.has_primary_key() {
        return insert;
    }

    let updates: Vec<String> = table
        .non_key_columns()
        .map(|c| format!("{0} = excluded.{0}", quote(&c.name)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "{insert} ON CONFLICT ({}) {action}",
        quoted_list(&table.primary_key)
    )
}

/// Delete one row by primary key.
pub fn delete_by_key(table: &TableDef) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote(&table.name),
        key_predicate(&table.primary_key)
    )
}

/// Primary keys of rows whose `column` is in a list of `count` values.
pub fn select_referencing(table: &TableDef, column: &str, count: usize) -> String {
    let placeholders: Vec<String> = (1..=count).map(|i| format!("?{i}")).collect();
    format!(
        "SELECT {} FROM {} WHERE {} IN ({})",
        quoted_list(&table.primary_key),
        quote(&table.name),
        quote(column),
        placeholders.join(", ")
    )
}

fn key_predicate(columns: &[String]) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert a core value for binding.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Date(d) => SqlValue::Text(d.to_string()),
    }
}

/// Bind parameters for a row, one per column in `ordered_columns` order.
pub fn row_params(table: &TableDef, row: &Row) -> Vec<SqlValue> {
    table
        .ordered_columns()
        .iter()
        .map(|c| row.get(&c.name).map_or(SqlValue::Null, to_sql))
        .collect()
}

/// Convert a stored value back, using the column kind when known.
pub fn from_sql(value: ValueRef<'_>, kind: Option<ColumnKind>) -> Value {
    match (value, kind) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(i), Some(ColumnKind::Boolean)) => Value::Bool(i != 0),
        (ValueRef::Integer(i), Some(ColumnKind::Float)) => Value::Float(i as f64),
        (ValueRef::Integer(i), _) => Value::Int(i),
        (ValueRef::Real(f), _) => Value::Float(f),
        (ValueRef::Text(t), Some(ColumnKind::Date)) => {
            let text = String::from_utf8_lossy(t);
            match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
                Ok(date) => Value::Date(date),
                Err(_) => Value::String(text.into_owned()),
            }
        }
        (ValueRef::Text(t), _) | (ValueRef::Blob(t), _) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

/// Declared type for a stored query-result column, inferred from its values.
pub fn inferred_type<'r>(column: &str, rows: impl IntoIterator<Item = &'r Row>) -> &'static str {
    let first = rows
        .into_iter()
        .filter_map(|r| r.get(column))
        .find(|v| !v.is_null());
    match first {
        Some(Value::Int(_)) | Some(Value::Bool(_)) => "INTEGER",
        Some(Value::Float(_)) => "REAL",
        _ => "TEXT",
    }
}
