//! Backend capability traits.
//!
//! The lifecycle engine decides what to do and in which order; a [`Backend`]
//! carries out one directive at a time. Implementations enforce foreign keys
//! with RESTRICT semantics and leave cascading to the engine.

mod memory;

pub use memory::{Directive, MemoryBackend};

use crate::catalog::TableDef;
use crate::value::{PrimaryKey, Row, Value};
use thiserror::Error;

/// Errors reported by backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The addressed table does not exist in the backend.
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// A row references a parent row that does not exist.
    #[error("foreign key violation: '{table}.{column}' references a missing '{references}' row")]
    ForeignKeyViolation {
        table: String,
        column: String,
        references: String,
    },

    /// A row or table is still referenced by another table.
    #[error("'{table}' is still referenced by '{referenced_by}'")]
    StillReferenced { table: String, referenced_by: String },

    /// A row is missing one of its primary key values.
    #[error("row for '{table}' is missing primary key column '{column}'")]
    MissingKey { table: String, column: String },

    /// Part of an upsert batch was applied before a row failed.
    #[error("upsert into '{table}' stopped after {applied} row(s): {cause}")]
    PartialUpsert {
        table: String,
        applied: usize,
        failed: Vec<Row>,
        #[source]
        cause: Box<BackendError>,
    },

    /// SQL execution error.
    #[error("{0}")]
    Sql(String),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Parent table whose missing row caused this error, if any.
    pub fn missing_dependency(&self) -> Option<&str> {
        match self {
            BackendError::ForeignKeyViolation { references, .. } => Some(references),
            BackendError::PartialUpsert { cause, .. } => cause.missing_dependency(),
            _ => None,
        }
    }
}

/// Storage backend executing lifecycle directives.
///
/// Every method is one unit of work: it either completes or fails without
/// leaving a partially-applied call behind, except `upsert_rows`, which
/// reports the rows it did not apply through [`BackendError::PartialUpsert`].
pub trait Backend: Send + Sync {
    /// Names of the tables currently present.
    fn table_names(&self) -> Result<Vec<String>, BackendError>;

    /// Create a table if it does not already exist.
    fn create_table(&self, table: &TableDef) -> Result<(), BackendError>;

    /// Insert rows, replacing any row with the same primary key.
    fn upsert_rows(&self, table: &TableDef, rows: &[Row]) -> Result<(), BackendError>;

    /// Delete rows by primary key. Unknown keys are ignored.
    fn delete_rows(&self, table: &TableDef, keys: &[PrimaryKey]) -> Result<(), BackendError>;

    /// Drop a table if it exists.
    fn drop_table(&self, table: &str) -> Result<(), BackendError>;

    /// Primary keys of rows in `child` whose `column` holds one of `values`.
    fn referencing_keys(
        &self,
        child: &TableDef,
        column: &str,
        values: &[Value],
    ) -> Result<Vec<PrimaryKey>, BackendError>;
}

/// Backend able to run opaque queries against built tables.
pub trait QueryBackend: Send + Sync {
    /// Execute a query and return its rows.
    fn execute_query(&self, query: &str) -> Result<Vec<Row>, BackendError>;
}

/// Destination for query results.
pub trait ResultStore: Send + Sync {
    /// Store rows under `identifier`, replacing any previous result.
    fn store_result(&self, identifier: &str, rows: &[Row]) -> Result<(), BackendError>;
}
