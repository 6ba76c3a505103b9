use super::{DropReport, LifecycleEngine};
use crate::backend::Backend;
use crate::catalog::SchemaModel;
use crate::error::{Error, Operation};
use crate::graph::DependencyGraph;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, info_span};

impl<B: Backend + ?Sized> LifecycleEngine<'_, B> {
    /// Drop the given tables, children first.
    ///
    /// Every table that references a requested table must itself be part of
    /// the request; otherwise nothing is dropped and `DependentTablesExist`
    /// names the missing dependents.
    pub fn drop_tables(&self, schema: &SchemaModel, tables: &[String]) -> Result<DropReport, Error> {
        let span = info_span!("drop_tables", tables = tables.len(), dry_run = self.config.dry_run);
        let _enter = span.enter();
        let start = Instant::now();

        let graph = DependencyGraph::build(schema)?;
        let requested: BTreeSet<String> = tables.iter().cloned().collect();

        for name in &requested {
            schema.table(name)?;
            let blockers: Vec<String> = graph
                .descendants(name)?
                .into_iter()
                .filter(|d| !requested.contains(d))
                .collect();
            if !blockers.is_empty() {
                return Err(Error::DependentTablesExist {
                    table: name.clone(),
                    blockers,
                });
            }
        }

        let mut dropped = Vec::with_capacity(requested.len());
        for name in graph.reverse_order_of(&requested) {
            self.checkpoint(Operation::DropTables, &dropped)?;
            if !self.config.dry_run {
                if let Err(source) = self.backend.drop_table(&name) {
                    return Err(self.step_failed(Operation::DropTables, &name, dropped, None, source));
                }
            }
            debug!(table = %name, "table dropped");
            dropped.push(name);
        }

        info!(
            tables = dropped.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "drop complete"
        );

        Ok(DropReport {
            dropped_tables: dropped,
            dry_run: self.config.dry_run,
        })
    }

    /// Drop every table of the schema, children first.
    pub fn drop_all(&self, schema: &SchemaModel) -> Result<DropReport, Error> {
        let all: Vec<String> = schema.table_names().into_iter().map(String::from).collect();
        self.drop_tables(schema, &all)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::clinical_schema;
    use super::*;
    use crate::backend::MemoryBackend;

    fn built() -> MemoryBackend {
        let backend = MemoryBackend::new();
        LifecycleEngine::new(&backend)
            .build(&clinical_schema())
            .unwrap();
        backend.clear_journal();
        backend
    }

    fn names(tables: &[&str]) -> Vec<String> {
        tables.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_drop_with_dependents_rejected() {
        let backend = built();
        let err = LifecycleEngine::new(&backend)
            .drop_tables(&clinical_schema(), &names(&["sample"]))
            .unwrap_err();

        match err {
            Error::DependentTablesExist { table, blockers } => {
                assert_eq!(table, "sample");
                assert_eq!(blockers, vec!["assay"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(backend.journal().is_empty());
    }

    #[test]
    fn test_drop_with_dependents_included() {
        let backend = built();
        let report = LifecycleEngine::new(&backend)
            .drop_tables(&clinical_schema(), &names(&["patient", "sample", "assay"]))
            .unwrap();

        assert_eq!(report.dropped_tables, vec!["assay", "sample", "patient"]);
        assert_eq!(backend.table_names().unwrap(), vec!["site"]);
    }

    #[test]
    fn test_drop_all() {
        let backend = built();
        let report = LifecycleEngine::new(&backend)
            .drop_all(&clinical_schema())
            .unwrap();

        assert_eq!(
            report.dropped_tables,
            vec!["site", "assay", "sample", "patient"]
        );
        assert!(backend.table_names().unwrap().is_empty());
    }

    #[test]
    fn test_drop_unknown_table() {
        let backend = built();
        let err = LifecycleEngine::new(&backend)
            .drop_tables(&clinical_schema(), &names(&["visit"]))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTable(_)));
    }
}
