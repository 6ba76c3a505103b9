use super::{BuildReport, LifecycleEngine};
use crate::backend::Backend;
use crate::catalog::SchemaModel;
use crate::error::{Error, Operation};
use crate::graph::DependencyGraph;
use std::time::Instant;
use tracing::{debug, info, info_span};

impl<B: Backend + ?Sized> LifecycleEngine<'_, B> {
    /// Create every table of the schema, parents first.
    ///
    /// Stops at the first failing table. Tables already present are left as
    /// they are, so a failed build can simply be re-run.
    pub fn build(&self, schema: &SchemaModel) -> Result<BuildReport, Error> {
        let span = info_span!("build", tables = schema.len(), dry_run = self.config.dry_run);
        let _enter = span.enter();
        let start = Instant::now();

        let graph = DependencyGraph::build(schema)?;
        let mut created = Vec::with_capacity(graph.len());

        for name in graph.topological_order() {
            self.checkpoint(Operation::Build, &created)?;
            let table = schema.table(&name)?;

            if !self.config.dry_run {
                if let Err(source) = self.backend.create_table(table) {
                    return Err(self.step_failed(Operation::Build, &name, created, None, source));
                }
            }
            debug!(table = %name, "table created");
            created.push(name);
        }

        info!(
            tables = created.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "build complete"
        );

        Ok(BuildReport {
            created_tables: created,
            dry_run: self.config.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::clinical_schema;
    use super::*;
    use crate::backend::{Directive, MemoryBackend};
    use crate::config::EngineConfig;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_build_in_dependency_order() {
        let backend = MemoryBackend::new();
        let report = LifecycleEngine::new(&backend)
            .build(&clinical_schema())
            .unwrap();

        assert_eq!(
            report.created_tables,
            vec!["patient", "sample", "assay", "site"]
        );
        let journal: Vec<_> = backend.journal().iter().map(|d| d.table().to_string()).collect();
        assert_eq!(journal, report.created_tables);
    }

    #[test]
    fn test_build_is_idempotent() {
        let backend = MemoryBackend::new();
        let engine = LifecycleEngine::new(&backend);
        engine.build(&clinical_schema()).unwrap();
        engine.build(&clinical_schema()).unwrap();

        assert_eq!(backend.table_names().unwrap().len(), 4);
    }

    #[test]
    fn test_build_fails_fast() {
        let backend = MemoryBackend::new();
        backend.fail_on(Operation::Build, "sample");

        let err = LifecycleEngine::new(&backend)
            .build(&clinical_schema())
            .unwrap_err();

        match err {
            Error::StepFailed {
                operation,
                table,
                completed_tables,
                ..
            } => {
                assert_eq!(operation, Operation::Build);
                assert_eq!(table, "sample");
                assert_eq!(completed_tables, vec!["patient"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            backend.journal(),
            vec![
                Directive::CreateTable("patient".to_string()),
                Directive::CreateTable("sample".to_string()),
            ]
        );
    }

    #[test]
    fn test_build_dry_run() {
        let backend = MemoryBackend::new();
        let report = LifecycleEngine::new(&backend)
            .with_config(EngineConfig::default().with_dry_run(true))
            .build(&clinical_schema())
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.created_tables.len(), 4);
        assert!(backend.journal().is_empty());
    }

    #[test]
    fn test_build_cancelled() {
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = LifecycleEngine::new(&backend)
            .with_cancel_token(token)
            .build(&clinical_schema())
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled { operation: Operation::Build, .. }));
        assert!(err.completed_tables().is_empty());
        assert!(backend.journal().is_empty());
    }
}
