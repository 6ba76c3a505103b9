//! Column definitions for tables.

use super::types::ColumnKind;
use serde::{Deserialize, Serialize};

/// A column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name (unique within its table).
    pub name: String,
    /// Declared data kind.
    pub kind: ColumnKind,
    /// Whether the column accepts nulls.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Fixed ordinal position for deterministic output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Whether backends should build a secondary index on this column.
    #[serde(default)]
    pub indexed: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    /// Create a new nullable column.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            position: None,
            indexed: false,
        }
    }

    /// Create a non-nullable column.
    pub fn required(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            nullable: false,
            ..Self::new(name, kind)
        }
    }

    /// Set the ordinal position.
    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Mark as indexed.
    pub fn with_index(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Compare name, kind and nullability only.
    pub fn is_equivalent(&self, other: &ColumnDef) -> bool {
        self.name == other.name && self.kind == other.kind && self.nullable == other.nullable
    }
}
