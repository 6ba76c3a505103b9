//! schemasync core - schema dependency graph and lifecycle engine.
//!
//! This crate decides *what* to do to a destination database and *in what
//! order*: tables are created parents-first, manifest rows are upserted
//! parents-first, and cascading deletes are marked to a fixpoint before any
//! row is removed children-first. Concrete storage lives behind the
//! [`Backend`] trait.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod manifest;
pub mod query;
pub mod sync;
pub mod value;

pub use backend::{Backend, BackendError, Directive, MemoryBackend, QueryBackend, ResultStore};
pub use catalog::{ColumnDef, ColumnKind, RelationDef, SchemaBuilder, SchemaError, SchemaModel, TableDef};
pub use config::{EngineConfig, SyncConfig};
pub use error::{Error, Operation};
pub use graph::DependencyGraph;
pub use lifecycle::{
    BuildReport, CascadePlan, CascadeReport, DropReport, LifecycleEngine, ReconcileReport,
    TableUpsert,
};
pub use manifest::{normalize_rows, ManifestError, ManifestSource, SchemaSource, SourceError};
pub use query::{QueryJob, QueryRunner};
pub use sync::{SyncReport, Synchronizer};
pub use value::{PrimaryKey, Row, Value};

/// Re-export of the cancellation token accepted by the engine.
pub use tokio_util::sync::CancellationToken;
