use super::{LifecycleEngine, ReconcileReport, TableUpsert};
use crate::backend::{Backend, BackendError};
use crate::catalog::{SchemaModel, TableDef};
use crate::error::{Error, Operation};
use crate::graph::DependencyGraph;
use crate::manifest::dedupe_by_key;
use crate::value::{Row, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;
use tracing::{debug, info, info_span};

/// A table's batch after validation and de-duplication.
struct PreparedBatch<'s> {
    table: &'s TableDef,
    rows: Vec<Row>,
    duplicates: usize,
}

impl<B: Backend + ?Sized> LifecycleEngine<'_, B> {
    /// Upsert row batches table by table, parents first.
    ///
    /// Every batch is validated before anything is written: the table must
    /// exist and have a primary key, and every row must carry its key. Rows
    /// sharing a key collapse to the last one. Tables without a batch are not
    /// touched. On failure the already-applied tables stay applied and the
    /// error carries the failing table's unapplied rows.
    pub fn reconcile(
        &self,
        schema: &SchemaModel,
        rows_by_table: BTreeMap<String, Vec<Row>>,
    ) -> Result<ReconcileReport, Error> {
        let span = info_span!(
            "reconcile",
            tables = rows_by_table.len(),
            dry_run = self.config.dry_run
        );
        let _enter = span.enter();
        let start = Instant::now();

        let graph = DependencyGraph::build(schema)?;
        let mut prepared = Self::prepare(schema, rows_by_table)?;

        let mut completed = Vec::new();
        let mut tables = Vec::new();

        for name in graph.topological_order() {
            let Some(batch) = prepared.remove(&name) else {
                continue;
            };
            self.checkpoint(Operation::Reconcile, &completed)?;

            let chunks: Vec<&[Row]> = batch.rows.chunks(self.batch_size()).collect();
            if !self.config.dry_run {
                for (i, chunk) in chunks.iter().enumerate() {
                    if let Err(source) = self.backend.upsert_rows(batch.table, chunk) {
                        let mut pending = match &source {
                            BackendError::PartialUpsert { failed, .. } => failed.clone(),
                            _ => chunk.to_vec(),
                        };
                        pending.extend(chunks[i + 1..].iter().flat_map(|c| c.iter().cloned()));
                        return Err(self.step_failed(
                            Operation::Reconcile,
                            &name,
                            completed,
                            Some(pending),
                            source,
                        ));
                    }
                }
            }

            debug!(
                table = %name,
                rows = batch.rows.len(),
                duplicates = batch.duplicates,
                "table reconciled"
            );
            tables.push(TableUpsert {
                table: name.clone(),
                rows: batch.rows.len(),
                duplicates_dropped: batch.duplicates,
                batches: chunks.len(),
            });
            completed.push(name);
        }

        let report = ReconcileReport {
            tables,
            dry_run: self.config.dry_run,
        };
        info!(
            tables = report.tables.len(),
            rows = report.total_rows(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "reconcile complete"
        );
        Ok(report)
    }

    fn prepare(
        schema: &SchemaModel,
        rows_by_table: BTreeMap<String, Vec<Row>>,
    ) -> Result<BTreeMap<String, PreparedBatch<'_>>, Error> {
        let mut prepared = BTreeMap::new();
        for (name, rows) in rows_by_table {
            let table = schema.table(&name)?;
            if !table.has_primary_key() {
                return Err(Error::NoPrimaryKey { table: name });
            }
            if rows.is_empty() {
                continue;
            }
            let (rows, duplicates) = dedupe_by_key(table, rows)?;
            let rows = parents_first(table, rows);
            prepared.insert(
                name,
                PreparedBatch {
                    table,
                    rows,
                    duplicates,
                },
            );
        }
        Ok(prepared)
    }
}

/// Reorder rows so that every row comes after the rows of the same batch it
/// references through a self-referencing foreign key.
///
/// Rows keep their relative order otherwise. Rows caught in a reference
/// cycle are appended in their original order.
fn parents_first(table: &TableDef, rows: Vec<Row>) -> Vec<Row> {
    let links: Vec<(&str, usize)> = table
        .relations
        .iter()
        .filter(|r| r.is_self_referencing())
        .filter_map(|r| Some((r.from_column.as_str(), table.key_position(&r.to_column)?)))
        .collect();
    if links.is_empty() || rows.len() < 2 {
        return rows;
    }

    let keys: Vec<_> = rows.iter().map(|r| r.key(&table.primary_key)).collect();
    let mut holders: HashMap<(usize, &Value), Vec<usize>> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        let Some(key) = key else { continue };
        for &(_, pos) in &links {
            if let Some(value) = key.get(pos) {
                holders.entry((pos, value)).or_default().push(i);
            }
        }
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); rows.len()];
    let mut waiting = vec![0usize; rows.len()];
    for (i, row) in rows.iter().enumerate() {
        let mut parents = BTreeSet::new();
        for &(column, pos) in &links {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            if let Some(found) = holders.get(&(pos, value)) {
                parents.extend(found.iter().copied().filter(|&p| p != i));
            }
        }
        waiting[i] = parents.len();
        for p in parents {
            children[p].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..rows.len()).filter(|&i| waiting[i] == 0).collect();
    let mut order = Vec::with_capacity(rows.len());
    let mut placed = vec![false; rows.len()];
    while let Some(i) = ready.pop_first() {
        order.push(i);
        placed[i] = true;
        for &c in &children[i] {
            waiting[c] -= 1;
            if waiting[c] == 0 {
                ready.insert(c);
            }
        }
    }
    order.extend((0..rows.len()).filter(|&i| !placed[i]));

    let mut slots: Vec<Option<Row>> = rows.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{assay, clinical_schema, patient, sample, CancelAfter};
    use super::*;
    use crate::backend::{Directive, MemoryBackend};
    use crate::config::EngineConfig;
    use crate::manifest::ManifestError;
    use crate::value::{PrimaryKey, Value};

    fn built() -> MemoryBackend {
        let backend = MemoryBackend::new();
        LifecycleEngine::new(&backend)
            .build(&clinical_schema())
            .unwrap();
        backend.clear_journal();
        backend
    }

    fn batches(rows: Vec<Row>) -> BTreeMap<String, Vec<Row>> {
        let mut map: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for row in rows {
            map.entry(row.table.clone()).or_default().push(row);
        }
        map
    }

    #[test]
    fn test_reconcile_parents_first() {
        let backend = built();
        let report = LifecycleEngine::new(&backend)
            .reconcile(
                &clinical_schema(),
                batches(vec![assay("A1", "S1"), sample("S1", "P1"), patient("P1")]),
            )
            .unwrap();

        assert_eq!(report.table_names(), vec!["patient", "sample", "assay"]);
        assert_eq!(report.total_rows(), 3);
        let order: Vec<_> = backend.journal().iter().map(|d| d.table().to_string()).collect();
        assert_eq!(order, vec!["patient", "sample", "assay"]);
    }

    #[test]
    fn test_last_duplicate_wins() {
        let backend = built();
        let rows = vec![
            patient("P1"),
            Row::new("patient").with("id", "P1").with("name", "second"),
        ];

        let report = LifecycleEngine::new(&backend)
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap();

        assert_eq!(report.tables[0].duplicates_dropped, 1);
        let stored = backend.rows("patient");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("name"), Some(&Value::from("second")));
    }

    #[test]
    fn test_missing_parent_reports_dependency() {
        let backend = built();
        let err = LifecycleEngine::new(&backend)
            .reconcile(&clinical_schema(), batches(vec![sample("S1", "P1")]))
            .unwrap_err();

        assert_eq!(err.missing_dependency(), Some("patient"));
        match err {
            Error::StepFailed {
                operation,
                table,
                pending_rows,
                completed_tables,
                ..
            } => {
                assert_eq!(operation, Operation::Reconcile);
                assert_eq!(table, "sample");
                assert!(completed_tables.is_empty());
                assert_eq!(pending_rows.map(|r| r.len()), Some(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_pending_rows_include_later_batches() {
        let backend = built();
        let rows = vec![
            patient("P1"),
            sample("S1", "P1"),
            sample("S2", "P9"),
            sample("S3", "P1"),
            sample("S4", "P1"),
        ];

        let err = LifecycleEngine::new(&backend)
            .with_config(EngineConfig::default().with_batch_size(2))
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap_err();

        match err {
            Error::StepFailed {
                pending_rows: Some(pending),
                completed_tables,
                ..
            } => {
                let ids: Vec<_> = pending.iter().map(|r| r.get("id").cloned()).collect();
                assert_eq!(
                    ids,
                    vec![
                        Some(Value::from("S2")),
                        Some(Value::from("S3")),
                        Some(Value::from("S4"))
                    ]
                );
                assert_eq!(completed_tables, vec!["patient"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(backend.contains_row("sample", &PrimaryKey::single("S1")));
    }

    #[test]
    fn test_validation_happens_before_writes() {
        let backend = built();
        let rows = vec![patient("P1"), Row::new("sample").with("patient_id", "P1")];

        let err = LifecycleEngine::new(&backend)
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Manifest(ManifestError::MissingPrimaryKey { .. })
        ));
        assert!(backend.journal().is_empty());
    }

    #[test]
    fn test_unknown_table_rejected() {
        let backend = built();
        let err = LifecycleEngine::new(&backend)
            .reconcile(
                &clinical_schema(),
                batches(vec![Row::new("visit").with("id", 1)]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTable(ref t) if t == "visit"));
    }

    #[test]
    fn test_batching() {
        let backend = built();
        let rows = (0..5).map(|i| patient(&format!("P{i}"))).collect();

        let report = LifecycleEngine::new(&backend)
            .with_config(EngineConfig::default().with_batch_size(2))
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap();

        assert_eq!(report.tables[0].batches, 3);
        assert_eq!(
            backend.journal(),
            vec![
                Directive::Upsert { table: "patient".into(), rows: 2 },
                Directive::Upsert { table: "patient".into(), rows: 2 },
                Directive::Upsert { table: "patient".into(), rows: 1 },
            ]
        );
    }

    fn ids(rows: &[Row]) -> Vec<String> {
        rows.iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    #[test]
    fn test_self_references_ordered_across_batches() {
        let backend = built();
        let rows = vec![
            patient("P1"),
            sample("S2", "P1").with("parent_id", "S3"),
            sample("S1", "P1"),
            sample("S3", "P1"),
        ];

        let report = LifecycleEngine::new(&backend)
            .with_config(EngineConfig::default().with_batch_size(2))
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap();

        assert_eq!(report.tables[1].batches, 2);
        assert_eq!(backend.row_count("sample"), 3);
        assert!(backend.contains_row("sample", &PrimaryKey::single("S2")));
    }

    #[test]
    fn test_self_reference_chain_one_row_per_batch() {
        let backend = built();
        let rows = vec![
            patient("P1"),
            sample("S4", "P1").with("parent_id", "S3"),
            sample("S3", "P1").with("parent_id", "S2"),
            sample("S2", "P1").with("parent_id", "S1"),
            sample("S1", "P1"),
        ];

        LifecycleEngine::new(&backend)
            .with_config(EngineConfig::default().with_batch_size(1))
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap();

        assert_eq!(backend.row_count("sample"), 4);
    }

    #[test]
    fn test_parents_first_ordering() {
        let schema = clinical_schema();
        let table = schema.get_table("sample").unwrap();

        let ordered = parents_first(
            table,
            vec![
                sample("S2", "P1").with("parent_id", "S3"),
                sample("S1", "P1"),
                sample("S3", "P1").with("parent_id", "S9"),
            ],
        );
        assert_eq!(ids(&ordered), vec!["S1", "S3", "S2"]);

        // Rows referencing each other stay in input order.
        let ordered = parents_first(
            table,
            vec![
                sample("S5", "P1").with("parent_id", "S6"),
                sample("S6", "P1").with("parent_id", "S5"),
                sample("S7", "P1"),
            ],
        );
        assert_eq!(ids(&ordered), vec!["S7", "S5", "S6"]);
    }

    #[test]
    fn test_zero_batch_size_field() {
        let backend = built();
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        let rows = vec![patient("P1"), patient("P2"), patient("P3")];

        let report = LifecycleEngine::new(&backend)
            .with_config(config)
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap();

        assert_eq!(report.tables[0].batches, 3);
        assert_eq!(backend.journal().len(), 3);
        assert_eq!(backend.row_count("patient"), 3);
    }

    #[test]
    fn test_cancelled_between_tables() {
        let backend = CancelAfter::new(built(), "patient");
        let engine = LifecycleEngine::new(&backend).with_cancel_token(backend.token.clone());
        let rows = vec![patient("P1"), sample("S1", "P1"), assay("A1", "S1")];

        let err = engine
            .reconcile(&clinical_schema(), batches(rows.clone()))
            .unwrap_err();

        match err {
            Error::Cancelled {
                operation,
                completed_tables,
            } => {
                assert_eq!(operation, Operation::Reconcile);
                assert_eq!(completed_tables, vec!["patient"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            backend.inner.journal(),
            vec![Directive::Upsert { table: "patient".into(), rows: 1 }]
        );
        assert_eq!(backend.inner.row_count("sample"), 0);

        // Re-running the same batches completes the remaining tables.
        LifecycleEngine::new(&backend.inner)
            .reconcile(&clinical_schema(), batches(rows))
            .unwrap();
        assert_eq!(backend.inner.row_count("assay"), 1);
    }
}
