//! Core error types.

use crate::backend::BackendError;
use crate::catalog::ColumnKind;
use crate::manifest::{ManifestError, SourceError};
use crate::value::Row;
use std::fmt;
use thiserror::Error;

/// Lifecycle operations that issue backend directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Table creation in topological order.
    Build,
    /// Row upserts in topological order.
    Reconcile,
    /// Row deletion in reverse topological order.
    CascadeDelete,
    /// Table drops in reverse topological order.
    DropTables,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Build => write!(f, "build"),
            Operation::Reconcile => write!(f, "reconcile"),
            Operation::CascadeDelete => write!(f, "cascade delete"),
            Operation::DropTables => write!(f, "drop tables"),
        }
    }
}

/// Structural problems found while constructing a schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Two tables share a name.
    #[error("duplicate table '{0}'")]
    DuplicateTable(String),

    /// A table declares no columns.
    #[error("table '{table}' has no columns")]
    NoColumns { table: String },

    /// A column has an empty name.
    #[error("table '{table}' has a column with an empty name")]
    EmptyColumnName { table: String },

    /// Two columns in one table share a name.
    #[error("duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    /// A primary key names a column the table does not have.
    #[error("primary key column '{column}' not found in table '{table}'")]
    PrimaryKeyColumnMissing { table: String, column: String },

    /// A foreign key names a source column the table does not have.
    #[error("foreign key column '{column}' not found in table '{table}'")]
    ForeignKeyColumnMissing { table: String, column: String },

    /// A relation was attached to a table other than the one it declares.
    #[error("relation declared on '{declared}' attached to table '{table}'")]
    RelationSourceMismatch { table: String, declared: String },

    /// A foreign key targets a table missing from the schema.
    #[error("table '{table}' references unknown table '{target}'")]
    UnknownTargetTable { table: String, target: String },

    /// A foreign key targets a column outside the target's primary key.
    #[error("table '{table}' references '{target}.{column}', which is not part of its primary key")]
    TargetColumnNotKey {
        table: String,
        target: String,
        column: String,
    },

    /// A foreign key column's kind cannot hold the target key's values.
    #[error("foreign key '{table}.{column}' ({kind}) cannot reference '{target}.{target_column}' ({target_kind})")]
    ForeignKeyKindMismatch {
        table: String,
        column: String,
        kind: ColumnKind,
        target: String,
        target_column: String,
        target_kind: ColumnKind,
    },

    /// A foreign key targets a table without a primary key.
    #[error("table '{table}' references '{target}', which has no primary key")]
    TargetWithoutPrimaryKey { table: String, target: String },

    /// The schema document could not be parsed.
    #[error("invalid schema document: {0}")]
    InvalidDocument(String),
}

/// Errors returned by the schema model, dependency graph and lifecycle engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The foreign-key graph contains a cycle between distinct tables.
    #[error("cyclic schema: {}", .tables.join(" -> "))]
    CyclicSchema { tables: Vec<String> },

    /// A drop was requested for a table whose dependents were not included.
    #[error("cannot drop '{table}': dependent tables exist ({})", .blockers.join(", "))]
    DependentTablesExist { table: String, blockers: Vec<String> },

    /// A backend call failed partway through an operation.
    #[error(
        "{operation} failed at table '{table}' after {} completed table(s): {source}",
        .completed_tables.len()
    )]
    StepFailed {
        operation: Operation,
        table: String,
        completed_tables: Vec<String>,
        pending_rows: Option<Vec<Row>>,
        #[source]
        source: BackendError,
    },

    /// The cancellation token fired between two steps.
    #[error("{operation} cancelled after {} completed table(s)", .completed_tables.len())]
    Cancelled {
        operation: Operation,
        completed_tables: Vec<String>,
    },

    /// Schema validation failure.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// An operation named a table that is not in the schema.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// Keyed operation addressed a table without a primary key.
    #[error("table '{table}' has no primary key")]
    NoPrimaryKey { table: String },

    /// A primary key has the wrong number of components for its table.
    #[error("key for '{table}' has {found} value(s), expected {expected}")]
    KeyArity {
        table: String,
        expected: usize,
        found: usize,
    },

    /// Manifest rows could not be normalized.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Schema or manifest source failure.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Backend failure outside a step sequence.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Query execution or result storage failed.
    #[error("query '{identifier}' failed: {source}")]
    Query {
        identifier: String,
        #[source]
        source: BackendError,
    },
}

impl Error {
    /// Tables whose step finished before the failure, in execution order.
    pub fn completed_tables(&self) -> &[String] {
        match self {
            Error::StepFailed {
                completed_tables, ..
            }
            | Error::Cancelled {
                completed_tables, ..
            } => completed_tables,
            _ => &[],
        }
    }

    /// Parent table whose missing row caused a foreign-key failure.
    pub fn missing_dependency(&self) -> Option<&str> {
        match self {
            Error::StepFailed { source, .. } | Error::Backend(source) => {
                source.missing_dependency()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_display() {
        let err = Error::StepFailed {
            operation: Operation::Build,
            table: "sample".to_string(),
            completed_tables: vec!["patient".to_string()],
            pending_rows: None,
            source: BackendError::Other("disk full".to_string()),
        };

        assert_eq!(
            err.to_string(),
            "build failed at table 'sample' after 1 completed table(s): disk full"
        );
        assert_eq!(err.completed_tables(), ["patient".to_string()]);
    }

    #[test]
    fn test_missing_dependency() {
        let err = Error::StepFailed {
            operation: Operation::Reconcile,
            table: "sample".to_string(),
            completed_tables: vec![],
            pending_rows: Some(vec![]),
            source: BackendError::ForeignKeyViolation {
                table: "sample".to_string(),
                column: "patient_id".to_string(),
                references: "patient".to_string(),
            },
        };

        assert_eq!(err.missing_dependency(), Some("patient"));
        assert_eq!(Error::UnknownTable("x".into()).missing_dependency(), None);
    }

    #[test]
    fn test_cycle_display() {
        let err = Error::CyclicSchema {
            tables: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "cyclic schema: a -> b");
    }
}
