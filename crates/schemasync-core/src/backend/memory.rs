//! In-memory backend.
//!
//! Enforces primary-key upserts and RESTRICT foreign keys, records every
//! directive it receives, and can be told to fail a given step. Used by the
//! engine's tests and for dry experiments with a schema.

use super::{Backend, BackendError, QueryBackend, ResultStore};
use crate::catalog::TableDef;
use crate::error::Operation;
use crate::value::{PrimaryKey, Row, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};

/// A directive received by the memory backend, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `create_table` call.
    CreateTable(String),
    /// `upsert_rows` call with its batch size.
    Upsert { table: String, rows: usize },
    /// `delete_rows` call with the requested keys.
    Delete { table: String, keys: Vec<PrimaryKey> },
    /// `drop_table` call.
    DropTable(String),
}

impl Directive {
    /// Table the directive addressed.
    pub fn table(&self) -> &str {
        match self {
            Directive::CreateTable(t) | Directive::DropTable(t) => t,
            Directive::Upsert { table, .. } | Directive::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug)]
struct StoredTable {
    def: TableDef,
    rows: BTreeMap<PrimaryKey, Row>,
    /// Rows of keyless tables.
    heap: Vec<Row>,
}

impl StoredTable {
    fn entries(&self) -> impl Iterator<Item = (Option<&PrimaryKey>, &Row)> {
        self.rows
            .iter()
            .map(|(k, r)| (Some(k), r))
            .chain(self.heap.iter().map(|r| (None, r)))
    }

    /// Check if some row's key holds `value` in the column `column`.
    fn has_key_value(&self, column: &str, value: &Value) -> bool {
        match self.def.key_position(column) {
            Some(pos) => self.rows.keys().any(|k| k.get(pos) == Some(value)),
            None => self.entries().any(|(_, r)| r.get(column) == Some(value)),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, StoredTable>,
    results: BTreeMap<String, Vec<Row>>,
}

/// In-memory [`Backend`], [`QueryBackend`] and [`ResultStore`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    journal: Mutex<Vec<Directive>>,
    failures: Mutex<HashSet<(Operation, String)>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next matching directives fail.
    ///
    /// `Build` fails `create_table`, `Reconcile` fails `upsert_rows`,
    /// `CascadeDelete` fails `delete_rows` and `DropTables` fails `drop_table`.
    pub fn fail_on(&self, operation: Operation, table: impl Into<String>) {
        self.failures.lock().insert((operation, table.into()));
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// All directives received so far.
    pub fn journal(&self) -> Vec<Directive> {
        self.journal.lock().clone()
    }

    /// Forget recorded directives.
    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Check if a table exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.state.read().tables.contains_key(table)
    }

    /// Rows of a table in primary-key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|t| t.entries().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len() + t.heap.len())
    }

    /// Check if a row with the given key exists.
    pub fn contains_row(&self, table: &str, key: &PrimaryKey) -> bool {
        self.state
            .read()
            .tables
            .get(table)
            .is_some_and(|t| t.rows.contains_key(key))
    }

    /// A stored query result.
    pub fn result(&self, identifier: &str) -> Option<Vec<Row>> {
        self.state.read().results.get(identifier).cloned()
    }

    fn record(&self, directive: Directive) {
        self.journal.lock().push(directive);
    }

    fn injected(&self, operation: Operation, table: &str) -> Result<(), BackendError> {
        if self
            .failures
            .lock()
            .contains(&(operation, table.to_string()))
        {
            return Err(BackendError::Other(format!(
                "injected {operation} failure on '{table}'"
            )));
        }
        Ok(())
    }

    fn check_row(state: &State, def: &TableDef, row: &Row, batch: &[Row]) -> Result<(), BackendError> {
        for column in &def.primary_key {
            if row.get(column).map_or(true, Value::is_null) {
                return Err(BackendError::MissingKey {
                    table: def.name.clone(),
                    column: column.clone(),
                });
            }
        }

        for relation in &def.relations {
            let Some(value) = row.get(&relation.from_column).filter(|v| !v.is_null()) else {
                continue;
            };
            let parent = state
                .tables
                .get(&relation.to_table)
                .ok_or_else(|| BackendError::TableNotFound(relation.to_table.clone()))?;

            let satisfied = parent.has_key_value(&relation.to_column, value)
                || (relation.is_self_referencing()
                    && batch.iter().any(|r| r.get(&relation.to_column) == Some(value)));
            if !satisfied {
                return Err(BackendError::ForeignKeyViolation {
                    table: def.name.clone(),
                    column: relation.from_column.clone(),
                    references: relation.to_table.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn table_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state.read().tables.keys().cloned().collect())
    }

    fn create_table(&self, table: &TableDef) -> Result<(), BackendError> {
        self.record(Directive::CreateTable(table.name.clone()));
        self.injected(Operation::Build, &table.name)?;

        let mut state = self.state.write();
        if state.tables.contains_key(&table.name) {
            return Ok(());
        }
        for relation in table.relations.iter().filter(|r| !r.is_self_referencing()) {
            if !state.tables.contains_key(&relation.to_table) {
                return Err(BackendError::TableNotFound(relation.to_table.clone()));
            }
        }
        state.tables.insert(
            table.name.clone(),
            StoredTable {
                def: table.clone(),
                rows: BTreeMap::new(),
                heap: Vec::new(),
            },
        );
        Ok(())
    }

    fn upsert_rows(&self, table: &TableDef, rows: &[Row]) -> Result<(), BackendError> {
        self.record(Directive::Upsert {
            table: table.name.clone(),
            rows: rows.len(),
        });
        self.injected(Operation::Reconcile, &table.name)?;

        let mut state = self.state.write();
        let def = state
            .tables
            .get(&table.name)
            .map(|t| t.def.clone())
            .ok_or_else(|| BackendError::TableNotFound(table.name.clone()))?;

        for (applied, row) in rows.iter().enumerate() {
            if let Err(cause) = Self::check_row(&state, &def, row, rows) {
                return Err(BackendError::PartialUpsert {
                    table: def.name.clone(),
                    applied,
                    failed: rows[applied..].to_vec(),
                    cause: Box::new(cause),
                });
            }

            let stored = state
                .tables
                .get_mut(&def.name)
                .ok_or_else(|| BackendError::TableNotFound(def.name.clone()))?;
            match row.key(&def.primary_key) {
                Some(key) if def.has_primary_key() => {
                    stored.rows.insert(key, row.clone());
                }
                _ => stored.heap.push(row.clone()),
            }
        }
        Ok(())
    }

    fn delete_rows(&self, table: &TableDef, keys: &[PrimaryKey]) -> Result<(), BackendError> {
        self.record(Directive::Delete {
            table: table.name.clone(),
            keys: keys.to_vec(),
        });
        self.injected(Operation::CascadeDelete, &table.name)?;

        let mut state = self.state.write();
        let target = state
            .tables
            .get(&table.name)
            .ok_or_else(|| BackendError::TableNotFound(table.name.clone()))?;
        let doomed: HashSet<&PrimaryKey> =
            keys.iter().filter(|k| target.rows.contains_key(k)).collect();

        for (child_name, child) in &state.tables {
            for relation in child.def.relations.iter().filter(|r| r.to_table == table.name) {
                let Some(pos) = target.def.key_position(&relation.to_column) else {
                    continue;
                };
                for (child_key, row) in child.entries() {
                    if *child_name == table.name && child_key.is_some_and(|k| doomed.contains(k)) {
                        continue;
                    }
                    let Some(value) = row.get(&relation.from_column).filter(|v| !v.is_null())
                    else {
                        continue;
                    };
                    let loses_parent = doomed.iter().any(|k| k.get(pos) == Some(value));
                    let keeps_parent = target
                        .rows
                        .keys()
                        .any(|k| !doomed.contains(k) && k.get(pos) == Some(value));
                    if loses_parent && !keeps_parent {
                        return Err(BackendError::StillReferenced {
                            table: table.name.clone(),
                            referenced_by: child_name.clone(),
                        });
                    }
                }
            }
        }

        let doomed: Vec<PrimaryKey> = doomed.into_iter().cloned().collect();
        if let Some(stored) = state.tables.get_mut(&table.name) {
            for key in &doomed {
                stored.rows.remove(key);
            }
        }
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<(), BackendError> {
        self.record(Directive::DropTable(table.to_string()));
        self.injected(Operation::DropTables, table)?;

        let mut state = self.state.write();
        if !state.tables.contains_key(table) {
            return Ok(());
        }
        let blocker = state.tables.values().find(|t| {
            t.def.name != table && t.def.relations.iter().any(|r| r.to_table == table)
        });
        if let Some(blocker) = blocker {
            return Err(BackendError::StillReferenced {
                table: table.to_string(),
                referenced_by: blocker.def.name.clone(),
            });
        }
        state.tables.remove(table);
        Ok(())
    }

    fn referencing_keys(
        &self,
        child: &TableDef,
        column: &str,
        values: &[Value],
    ) -> Result<Vec<PrimaryKey>, BackendError> {
        let state = self.state.read();
        let stored = state
            .tables
            .get(&child.name)
            .ok_or_else(|| BackendError::TableNotFound(child.name.clone()))?;
        let wanted: HashSet<&Value> = values.iter().collect();

        Ok(stored
            .rows
            .iter()
            .filter(|(_, row)| row.get(column).is_some_and(|v| wanted.contains(v)))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

impl QueryBackend for MemoryBackend {
    /// The query is a table name; the result is a full scan of that table.
    fn execute_query(&self, query: &str) -> Result<Vec<Row>, BackendError> {
        let table = query.trim();
        let state = self.state.read();
        let stored = state
            .tables
            .get(table)
            .ok_or_else(|| BackendError::TableNotFound(table.to_string()))?;
        Ok(stored.entries().map(|(_, r)| r.clone()).collect())
    }
}

impl ResultStore for MemoryBackend {
    fn store_result(&self, identifier: &str, rows: &[Row]) -> Result<(), BackendError> {
        self.state
            .write()
            .results
            .insert(identifier.to_string(), rows.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnKind};

    fn patient() -> TableDef {
        TableDef::new("patient")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("name", ColumnKind::String))
            .with_primary_key(["id"])
    }

    fn sample() -> TableDef {
        TableDef::new("sample")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("patient_id", ColumnKind::String))
            .with_column(ColumnDef::new("parent_id", ColumnKind::String))
            .with_primary_key(["id"])
            .with_relation("patient_id", "patient", "id")
            .with_relation("parent_id", "sample", "id")
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_table(&patient()).unwrap();
        backend.create_table(&sample()).unwrap();
        backend
    }

    #[test]
    fn test_create_requires_parent_table() {
        let backend = MemoryBackend::new();
        let err = backend.create_table(&sample()).unwrap_err();
        assert!(matches!(err, BackendError::TableNotFound(ref t) if t == "patient"));
    }

    #[test]
    fn test_create_is_idempotent() {
        let backend = backend();
        backend.create_table(&patient()).unwrap();
        assert_eq!(backend.table_names().unwrap(), vec!["patient", "sample"]);
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let backend = backend();
        let table = patient();
        backend
            .upsert_rows(&table, &[Row::new("patient").with("id", "P1").with("name", "Ann")])
            .unwrap();
        backend
            .upsert_rows(&table, &[Row::new("patient").with("id", "P1").with("name", "Bea")])
            .unwrap();

        let rows = backend.rows("patient");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::from("Bea")));
    }

    #[test]
    fn test_upsert_enforces_foreign_keys() {
        let backend = backend();
        let rows = vec![
            Row::new("sample").with("id", "S1"),
            Row::new("sample").with("id", "S2").with("patient_id", "P9"),
            Row::new("sample").with("id", "S3"),
        ];

        let err = backend.upsert_rows(&sample(), &rows).unwrap_err();
        match err {
            BackendError::PartialUpsert {
                applied, failed, ..
            } => {
                assert_eq!(applied, 1);
                assert_eq!(failed.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(backend.row_count("sample"), 1);
    }

    #[test]
    fn test_self_reference_within_batch() {
        let backend = backend();
        let rows = vec![
            Row::new("sample").with("id", "S2").with("parent_id", "S1"),
            Row::new("sample").with("id", "S1"),
        ];
        backend.upsert_rows(&sample(), &rows).unwrap();
        assert_eq!(backend.row_count("sample"), 2);
    }

    #[test]
    fn test_delete_is_restricted() {
        let backend = backend();
        backend
            .upsert_rows(&patient(), &[Row::new("patient").with("id", "P1")])
            .unwrap();
        backend
            .upsert_rows(
                &sample(),
                &[Row::new("sample").with("id", "S1").with("patient_id", "P1")],
            )
            .unwrap();

        let err = backend
            .delete_rows(&patient(), &[PrimaryKey::single("P1")])
            .unwrap_err();
        assert!(matches!(err, BackendError::StillReferenced { .. }));

        backend
            .delete_rows(&sample(), &[PrimaryKey::single("S1")])
            .unwrap();
        backend
            .delete_rows(&patient(), &[PrimaryKey::single("P1")])
            .unwrap();
        assert_eq!(backend.row_count("patient"), 0);
    }

    #[test]
    fn test_drop_is_restricted() {
        let backend = backend();
        assert!(backend.drop_table("patient").is_err());
        backend.drop_table("sample").unwrap();
        backend.drop_table("patient").unwrap();
        backend.drop_table("patient").unwrap();
        assert!(backend.table_names().unwrap().is_empty());
    }

    #[test]
    fn test_injected_failure_and_journal() {
        let backend = MemoryBackend::new();
        backend.fail_on(Operation::Build, "patient");

        assert!(backend.create_table(&patient()).is_err());
        assert!(!backend.has_table("patient"));
        assert_eq!(
            backend.journal(),
            vec![Directive::CreateTable("patient".to_string())]
        );

        backend.clear_failures();
        backend.create_table(&patient()).unwrap();
        assert!(backend.has_table("patient"));
    }

    #[test]
    fn test_query_and_store() {
        let backend = backend();
        backend
            .upsert_rows(&patient(), &[Row::new("patient").with("id", "P1")])
            .unwrap();

        let rows = backend.execute_query("patient").unwrap();
        backend.store_result("all_patients", &rows).unwrap();
        assert_eq!(backend.result("all_patients").map(|r| r.len()), Some(1));
        assert!(backend.execute_query("missing").is_err());
    }
}
