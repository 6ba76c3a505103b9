//! Schema model - the validated set of tables a lifecycle operation runs against.

use super::TableDef;
use super::RelationDef;
use crate::error::{Error, SchemaError};
use crate::graph::DependencyGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A validated mapping from table name to table definition.
///
/// Construction checks every structural invariant and rejects multi-table
/// foreign-key cycles, so a `SchemaModel` in hand is always orderable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaDocument", into = "SchemaDocument")]
pub struct SchemaModel {
    tables: BTreeMap<String, TableDef>,
}

/// On-disk shape of a schema: `{ "tables": [ ... ] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaDocument {
    tables: Vec<TableDef>,
}

impl TryFrom<SchemaDocument> for SchemaModel {
    type Error = Error;

    fn try_from(doc: SchemaDocument) -> Result<Self, Self::Error> {
        SchemaModel::new(doc.tables)
    }
}

impl From<SchemaModel> for SchemaDocument {
    fn from(schema: SchemaModel) -> Self {
        SchemaDocument {
            tables: schema.tables.into_values().collect(),
        }
    }
}

impl SchemaModel {
    /// Validate a set of tables and build the schema.
    pub fn new(tables: Vec<TableDef>) -> Result<Self, Error> {
        let mut by_name = BTreeMap::new();
        for mut table in tables {
            for relation in &mut table.relations {
                if relation.from_table.is_empty() {
                    relation.from_table = table.name.clone();
                }
            }
            table.validate()?;
            if by_name.contains_key(&table.name) {
                return Err(SchemaError::DuplicateTable(table.name).into());
            }
            by_name.insert(table.name.clone(), table);
        }

        for table in by_name.values() {
            for relation in &table.relations {
                let target = by_name.get(&relation.to_table).ok_or_else(|| {
                    SchemaError::UnknownTargetTable {
                        table: table.name.clone(),
                        target: relation.to_table.clone(),
                    }
                })?;
                if !target.has_primary_key() {
                    return Err(SchemaError::TargetWithoutPrimaryKey {
                        table: table.name.clone(),
                        target: target.name.clone(),
                    }
                    .into());
                }
                if target.key_position(&relation.to_column).is_none() {
                    return Err(SchemaError::TargetColumnNotKey {
                        table: table.name.clone(),
                        target: target.name.clone(),
                        column: relation.to_column.clone(),
                    }
                    .into());
                }
                if let (Some(kind), Some(target_kind)) = (
                    table.column_kind(&relation.from_column),
                    target.column_kind(&relation.to_column),
                ) {
                    if !kind.is_compatible(target_kind) {
                        return Err(SchemaError::ForeignKeyKindMismatch {
                            table: table.name.clone(),
                            column: relation.from_column.clone(),
                            kind,
                            target: target.name.clone(),
                            target_column: relation.to_column.clone(),
                            target_kind,
                        }
                        .into());
                    }
                }
            }
        }

        // Rejects genuine cycles; self-references are fine.
        DependencyGraph::from_tables(&by_name)?;

        Ok(Self { tables: by_name })
    }

    /// Parse and validate a JSON schema document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let doc: SchemaDocument = serde_json::from_str(json)
            .map_err(|e| SchemaError::InvalidDocument(e.to_string()))?;
        Self::try_from(doc)
    }

    /// Get a table by name.
    pub fn get_table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Get a table by name, failing with `UnknownTable`.
    pub fn table(&self, name: &str) -> Result<&TableDef, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// All tables keyed by name.
    pub fn tables(&self) -> &BTreeMap<String, TableDef> {
        &self.tables
    }

    /// Table names in ascending order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a table exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if the schema has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Every foreign key in the schema.
    pub fn relations(&self) -> impl Iterator<Item = &RelationDef> {
        self.tables.values().flat_map(|t| t.relations.iter())
    }

    /// Foreign keys pointing at a table, including self-references.
    pub fn relations_to(&self, table: &str) -> Vec<&RelationDef> {
        self.relations().filter(|r| r.to_table == table).collect()
    }

    /// Tables directly referenced by `table`, excluding itself.
    pub fn dependencies(&self, table: &str) -> Result<Vec<&str>, Error> {
        Ok(self.table(table)?.dependencies())
    }

    /// Tables that directly reference `table`, excluding itself.
    pub fn reverse_dependencies(&self, table: &str) -> Result<Vec<&str>, Error> {
        self.table(table)?;
        let mut deps: Vec<&str> = self
            .relations_to(table)
            .into_iter()
            .filter(|r| !r.is_self_referencing())
            .map(|r| r.from_table.as_str())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        Ok(deps)
    }

    /// Compare two schemas table by table, ignoring column order and index flags.
    pub fn is_equivalent(&self, other: &SchemaModel) -> bool {
        self.tables.len() == other.tables.len()
            && self.tables.iter().all(|(name, table)| {
                other
                    .tables
                    .get(name)
                    .is_some_and(|theirs| table.is_equivalent(theirs))
            })
    }
}

/// Incremental builder for a [`SchemaModel`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<TableDef>,
}

impl SchemaBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table.
    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    /// Validate and build the schema.
    pub fn build(self) -> Result<SchemaModel, Error> {
        SchemaModel::new(self.tables)
    }
}
