//! Table definitions.

use super::column::ColumnDef;
use super::relation::RelationDef;
use super::types::ColumnKind;
use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A table definition: columns, primary key and outgoing foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name (unique within the schema).
    pub name: String,
    /// Column definitions in declared order.
    pub columns: Vec<ColumnDef>,
    /// Primary key column names; empty for a keyless table.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Outgoing foreign keys.
    #[serde(default)]
    pub relations: Vec<RelationDef>,
}

impl TableDef {
    /// Create a new table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Add a column to the table.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add multiple columns.
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Set the primary key columns.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add a foreign key from `column` to `to_table.to_column`.
    pub fn with_relation(
        mut self,
        column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        let relation = RelationDef::new(self.name.clone(), column, to_table, to_column);
        self.relations.push(relation);
        self
    }

    /// Get a column by name.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Kind of a column, if it exists.
    pub fn column_kind(&self, name: &str) -> Option<ColumnKind> {
        self.get_column(name).map(|c| c.kind)
    }

    /// Names of all columns in declared order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns sorted by fixed position, then declared order.
    pub fn ordered_columns(&self) -> Vec<&ColumnDef> {
        let mut columns: Vec<(usize, &ColumnDef)> = self.columns.iter().enumerate().collect();
        columns.sort_by_key(|(declared, c)| (c.position.unwrap_or(usize::MAX), *declared));
        columns.into_iter().map(|(_, c)| c).collect()
    }

    /// Check if the table has a primary key.
    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Position of a column within the primary key.
    pub fn key_position(&self, column: &str) -> Option<usize> {
        self.primary_key.iter().position(|k| k == column)
    }

    /// Columns that are not part of the primary key.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| !self.primary_key.contains(&c.name))
    }

    /// Names of the tables this table references, excluding itself.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .relations
            .iter()
            .filter(|r| !r.is_self_referencing())
            .map(|r| r.to_table.as_str())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Check the table's internal consistency.
    ///
    /// Cross-table checks (relation targets) are done by the schema.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns {
                table: self.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(SchemaError::EmptyColumnName {
                    table: self.name.clone(),
                });
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        for key in &self.primary_key {
            if !seen.contains(key.as_str()) {
                return Err(SchemaError::PrimaryKeyColumnMissing {
                    table: self.name.clone(),
                    column: key.clone(),
                });
            }
        }

        for relation in &self.relations {
            if relation.from_table != self.name {
                return Err(SchemaError::RelationSourceMismatch {
                    table: self.name.clone(),
                    declared: relation.from_table.clone(),
                });
            }
            if !seen.contains(relation.from_column.as_str()) {
                return Err(SchemaError::ForeignKeyColumnMissing {
                    table: self.name.clone(),
                    column: relation.from_column.clone(),
                });
            }
        }

        Ok(())
    }

    /// Compare two tables ignoring column order, positions and index flags.
    pub fn is_equivalent(&self, other: &TableDef) -> bool {
        if self.name != other.name
            || self.primary_key != other.primary_key
            || self.columns.len() != other.columns.len()
        {
            return false;
        }

        let mut ours: Vec<&ColumnDef> = self.columns.iter().collect();
        let mut theirs: Vec<&ColumnDef> = other.columns.iter().collect();
        ours.sort_by(|a, b| a.name.cmp(&b.name));
        theirs.sort_by(|a, b| a.name.cmp(&b.name));
        if !ours.iter().zip(&theirs).all(|(a, b)| a.is_equivalent(b)) {
            return false;
        }

        let mut our_relations = self.relations.clone();
        let mut their_relations = other.relations.clone();
        our_relations.sort();
        their_relations.sort();
        our_relations == their_relations
    }
}
