//! Outcome reports for lifecycle operations.

use crate::value::PrimaryKey;

/// Result of a build pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Tables created (or confirmed present), in creation order.
    pub created_tables: Vec<String>,
    /// Whether no directive was actually issued.
    pub dry_run: bool,
}

/// Rows applied to one table during reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpsert {
    /// Table name.
    pub table: String,
    /// Rows upserted after de-duplication.
    pub rows: usize,
    /// Earlier rows discarded because a later row shared their key.
    pub duplicates_dropped: usize,
    /// Number of `upsert_rows` calls issued.
    pub batches: usize,
}

/// Result of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Per-table outcome, in the order tables were processed.
    pub tables: Vec<TableUpsert>,
    /// Whether no directive was actually issued.
    pub dry_run: bool,
}

impl ReconcileReport {
    /// Total rows upserted across all tables.
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }

    /// Names of the tables that received rows.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.table.as_str()).collect()
    }
}

/// Pending deletions computed by the mark phase of a cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan {
    /// Table the cascade was seeded from.
    pub root: String,
    /// Keys to delete per table, in delete order (children first).
    pub deletions: Vec<(String, Vec<PrimaryKey>)>,
}

impl CascadePlan {
    /// Total number of keys marked for deletion.
    pub fn total_rows(&self) -> usize {
        self.deletions.iter().map(|(_, keys)| keys.len()).sum()
    }

    /// Tables touched by the cascade, in delete order.
    pub fn tables(&self) -> Vec<&str> {
        self.deletions.iter().map(|(t, _)| t.as_str()).collect()
    }

    /// Keys marked for a table.
    pub fn keys_for(&self, table: &str) -> Option<&[PrimaryKey]> {
        self.deletions
            .iter()
            .find(|(t, _)| t == table)
            .map(|(_, keys)| keys.as_slice())
    }
}

/// Result of a cascading delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    /// The executed plan.
    pub plan: CascadePlan,
    /// Tables whose deletions completed, in delete order.
    pub completed_tables: Vec<String>,
    /// Whether no directive was actually issued.
    pub dry_run: bool,
}

/// Result of a drop pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropReport {
    /// Tables dropped, in drop order.
    pub dropped_tables: Vec<String>,
    /// Whether no directive was actually issued.
    pub dry_run: bool,
}
