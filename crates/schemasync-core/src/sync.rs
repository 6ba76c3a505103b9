//! Manifest synchronization.
//!
//! Pulls every table's manifests from a [`ManifestSource`], normalizes them
//! and hands them to a single reconcile pass.

use crate::backend::Backend;
use crate::catalog::SchemaModel;
use crate::config::SyncConfig;
use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::lifecycle::{BuildReport, LifecycleEngine, ReconcileReport};
use crate::manifest::{normalize_rows, ManifestSource};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

/// Outcome of a synchronization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Build pass result, if one was run.
    pub build: Option<BuildReport>,
    /// Reconcile pass result.
    pub reconcile: ReconcileReport,
    /// Tables skipped because no manifest rows were found.
    pub skipped_tables: Vec<String>,
    /// Rows fetched before normalization.
    pub fetched_rows: usize,
}

/// Synchronizes manifest rows into a backend.
pub struct Synchronizer<'a, S: ManifestSource + ?Sized, B: Backend + ?Sized> {
    source: &'a S,
    engine: LifecycleEngine<'a, B>,
    config: SyncConfig,
}

impl<'a, S: ManifestSource + ?Sized, B: Backend + ?Sized> Synchronizer<'a, S, B> {
    /// Create a synchronizer over a manifest source and an engine.
    pub fn new(source: &'a S, engine: LifecycleEngine<'a, B>) -> Self {
        Self {
            source,
            engine,
            config: SyncConfig::default(),
        }
    }

    /// Use the given configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetch, normalize and reconcile the manifests of every table.
    pub fn sync(&self, schema: &SchemaModel) -> Result<SyncReport, Error> {
        let span = info_span!("sync", tables = schema.len());
        let _enter = span.enter();
        let start = Instant::now();

        let graph = DependencyGraph::build(schema)?;
        let mut batches = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut fetched = 0;

        for name in graph.topological_order() {
            let table = schema.table(&name)?;
            if !table.has_primary_key() {
                warn!(table = %name, "table has no primary key, skipped");
                skipped.push(name);
                continue;
            }

            let rows = self.source.fetch_rows(&name, self.config.since_version)?;
            if rows.is_empty() {
                warn!(table = %name, "no manifests found");
                skipped.push(name);
                continue;
            }
            fetched += rows.len();
            let rows = normalize_rows(table, rows)?;
            debug!(table = %name, rows = rows.len(), "manifests loaded");
            batches.insert(name, rows);
        }

        let build = if self.config.build_missing_tables {
            Some(self.engine.build(schema)?)
        } else {
            None
        };
        let reconcile = self.engine.reconcile(schema, batches)?;

        info!(
            fetched,
            upserted = reconcile.total_rows(),
            skipped = skipped.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sync complete"
        );

        Ok(SyncReport {
            build,
            reconcile,
            skipped_tables: skipped,
            fetched_rows: fetched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::lifecycle::fixtures::{assay, clinical_schema, patient, sample};
    use crate::manifest::SourceError;
    use crate::value::{Row, Value};
    use std::collections::HashMap;

    #[derive(Default)]
    struct StaticSource {
        rows: HashMap<String, Vec<Row>>,
    }

    impl StaticSource {
        fn with(mut self, row: Row) -> Self {
            self.rows.entry(row.table.clone()).or_default().push(row);
            self
        }
    }

    impl ManifestSource for StaticSource {
        fn fetch_rows(&self, table: &str, since: Option<u64>) -> Result<Vec<Row>, SourceError> {
            if since.is_some_and(|v| v > 10) {
                return Ok(Vec::new());
            }
            Ok(self.rows.get(table).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn test_sync_builds_and_reconciles() {
        let backend = MemoryBackend::new();
        let source = StaticSource::default()
            .with(assay("A1", "S1").with("result", 4i64))
            .with(sample("S1", "P1"))
            .with(patient("P1"));

        let report = Synchronizer::new(&source, LifecycleEngine::new(&backend))
            .sync(&clinical_schema())
            .unwrap();

        assert_eq!(report.build.map(|b| b.created_tables.len()), Some(4));
        assert_eq!(report.fetched_rows, 3);
        assert_eq!(report.reconcile.table_names(), vec!["patient", "sample", "assay"]);
        assert_eq!(report.skipped_tables, vec!["site"]);

        // integer manifest value widened to the float column
        let assays = backend.rows("assay");
        assert_eq!(assays[0].get("result"), Some(&Value::Float(4.0)));
    }

    #[test]
    fn test_sync_without_build_needs_tables() {
        let backend = MemoryBackend::new();
        let source = StaticSource::default().with(patient("P1"));

        let err = Synchronizer::new(&source, LifecycleEngine::new(&backend))
            .with_config(SyncConfig::default().with_build(false))
            .sync(&clinical_schema())
            .unwrap_err();

        assert!(matches!(err, Error::StepFailed { .. }));
    }

    #[test]
    fn test_sync_since_version() {
        let backend = MemoryBackend::new();
        let source = StaticSource::default().with(patient("P1"));

        let report = Synchronizer::new(&source, LifecycleEngine::new(&backend))
            .with_config(SyncConfig::default().with_since_version(11))
            .sync(&clinical_schema())
            .unwrap();

        assert_eq!(report.fetched_rows, 0);
        assert_eq!(report.skipped_tables.len(), 4);
        assert!(report.reconcile.tables.is_empty());
    }
}
