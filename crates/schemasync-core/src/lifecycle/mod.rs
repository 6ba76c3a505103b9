//! Lifecycle engine.
//!
//! Orders backend directives by the schema's foreign-key dependencies:
//! - build creates tables parents-first
//! - reconcile upserts row batches parents-first
//! - cascade delete marks dependent rows to a fixpoint, then deletes children-first
//! - drop removes tables children-first
//!
//! The engine never retries and never rolls back. Every failure reports the
//! step that failed and the tables already completed.

mod build;
mod cascade;
mod reconcile;
mod report;
mod teardown;

pub use report::{
    BuildReport, CascadePlan, CascadeReport, DropReport, ReconcileReport, TableUpsert,
};

use crate::backend::{Backend, BackendError};
use crate::config::EngineConfig;
use crate::error::{Error, Operation};
use crate::value::Row;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Runs build, reconcile, cascade delete and drop against a backend.
pub struct LifecycleEngine<'a, B: Backend + ?Sized> {
    backend: &'a B,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl<'a, B: Backend + ?Sized> LifecycleEngine<'a, B> {
    /// Create an engine with the default configuration.
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            config: EngineConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use the given configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop between steps once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The backend directives are issued to.
    pub fn backend(&self) -> &B {
        self.backend
    }

    /// Rows per backend call, never less than one.
    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Fail with `Cancelled` if the token has fired.
    fn checkpoint(&self, operation: Operation, completed: &[String]) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            warn!(%operation, completed = completed.len(), "operation cancelled");
            return Err(Error::Cancelled {
                operation,
                completed_tables: completed.to_vec(),
            });
        }
        Ok(())
    }

    fn step_failed(
        &self,
        operation: Operation,
        table: &str,
        completed: Vec<String>,
        pending_rows: Option<Vec<Row>>,
        source: BackendError,
    ) -> Error {
        error!(%operation, table = %table, completed = completed.len(), error = %source, "step failed");
        Error::StepFailed {
            operation,
            table: table.to_string(),
            completed_tables: completed,
            pending_rows,
            source,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::backend::{Backend, BackendError, MemoryBackend};
    use crate::catalog::{ColumnDef, ColumnKind, SchemaModel, TableDef};
    use crate::value::{PrimaryKey, Row, Value};
    use tokio_util::sync::CancellationToken;

    /// Memory backend that fires a token once a call on `table` succeeds.
    pub struct CancelAfter {
        pub inner: MemoryBackend,
        pub token: CancellationToken,
        table: String,
    }

    impl CancelAfter {
        pub fn new(inner: MemoryBackend, table: &str) -> Self {
            Self {
                inner,
                token: CancellationToken::new(),
                table: table.to_string(),
            }
        }

        fn trip<T>(&self, table: &str, result: Result<T, BackendError>) -> Result<T, BackendError> {
            if result.is_ok() && table == self.table {
                self.token.cancel();
            }
            result
        }
    }

    impl Backend for CancelAfter {
        fn table_names(&self) -> Result<Vec<String>, BackendError> {
            self.inner.table_names()
        }

        fn create_table(&self, table: &TableDef) -> Result<(), BackendError> {
            self.trip(&table.name, self.inner.create_table(table))
        }

        fn upsert_rows(&self, table: &TableDef, rows: &[Row]) -> Result<(), BackendError> {
            self.trip(&table.name, self.inner.upsert_rows(table, rows))
        }

        fn delete_rows(&self, table: &TableDef, keys: &[PrimaryKey]) -> Result<(), BackendError> {
            self.trip(&table.name, self.inner.delete_rows(table, keys))
        }

        fn drop_table(&self, table: &str) -> Result<(), BackendError> {
            self.trip(table, self.inner.drop_table(table))
        }

        fn referencing_keys(
            &self,
            child: &TableDef,
            column: &str,
            values: &[Value],
        ) -> Result<Vec<PrimaryKey>, BackendError> {
            self.trip(&child.name, self.inner.referencing_keys(child, column, values))
        }
    }

    /// patient <- sample <- assay, plus an unrelated `site` table.
    pub fn clinical_schema() -> SchemaModel {
        let patient = TableDef::new("patient")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("name", ColumnKind::String))
            .with_primary_key(["id"]);
        let sample = TableDef::new("sample")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("patient_id", ColumnKind::String))
            .with_column(ColumnDef::new("parent_id", ColumnKind::String))
            .with_primary_key(["id"])
            .with_relation("patient_id", "patient", "id")
            .with_relation("parent_id", "sample", "id");
        let assay = TableDef::new("assay")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("sample_id", ColumnKind::String))
            .with_column(ColumnDef::new("result", ColumnKind::Float))
            .with_primary_key(["id"])
            .with_relation("sample_id", "sample", "id");
        let site = TableDef::new("site")
            .with_column(ColumnDef::required("code", ColumnKind::String))
            .with_primary_key(["code"]);

        SchemaModel::new(vec![assay, patient, sample, site]).unwrap()
    }

    pub fn patient(id: &str) -> Row {
        Row::new("patient").with("id", id).with("name", format!("name-{id}"))
    }

    pub fn sample(id: &str, patient_id: &str) -> Row {
        Row::new("sample").with("id", id).with("patient_id", patient_id)
    }

    pub fn assay(id: &str, sample_id: &str) -> Row {
        Row::new("assay").with("id", id).with("sample_id", sample_id)
    }
}
