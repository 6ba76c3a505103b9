//! Foreign-key relations between tables.

use serde::{Deserialize, Serialize};

/// A foreign key: `from_table.from_column` references `to_table.to_column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationDef {
    /// Table declaring the foreign key (the child).
    ///
    /// May be left empty in schema documents; the owning table fills it in.
    #[serde(default)]
    pub from_table: String,
    /// Foreign-key column on the child.
    pub from_column: String,
    /// Referenced table (the parent).
    pub to_table: String,
    /// Referenced column; must belong to the parent's primary key.
    pub to_column: String,
}

impl RelationDef {
    /// Create a relation.
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            from_column: from_column.into(),
            to_table: to_table.into(),
            to_column: to_column.into(),
        }
    }

    /// Check if the relation points back at its own table.
    pub fn is_self_referencing(&self) -> bool {
        self.from_table == self.to_table
    }
}
