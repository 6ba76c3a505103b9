//! CLI error types.

use thiserror::Error;

/// Errors surfaced by the `schemasync` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// Lifecycle engine error.
    #[error(transparent)]
    Core(#[from] schemasync_core::Error),

    /// Database error outside a lifecycle step.
    #[error("database error: {0}")]
    Backend(#[from] schemasync_core::BackendError),

    /// Schema, manifest or job file error.
    #[error("source error: {0}")]
    Source(#[from] schemasync_core::SourceError),

    /// A key given on the command line could not be converted.
    #[error("key error: {0}")]
    Manifest(#[from] schemasync_core::ManifestError),

    /// A key given on the command line has the wrong number of values.
    #[error("key '{key}' for '{table}' needs {expected} comma-separated value(s)")]
    InvalidKey {
        table: String,
        key: String,
        expected: usize,
    },
}
