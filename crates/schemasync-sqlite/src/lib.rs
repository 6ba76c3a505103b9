//! SQLite backend for schemasync.
//!
//! Tables get typed columns, NOT NULL, composite primary keys, foreign keys
//! and secondary indexes. Foreign keys are enforced and deferred to the end
//! of each call, so a batch may reference rows it inserts itself.

mod sql;

use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, Transaction};
use schemasync_core::{
    Backend, BackendError, PrimaryKey, QueryBackend, ResultStore, Row, TableDef, Value,
};
use std::path::Path;
use tracing::debug;

/// Maximum bound parameters per `IN (...)` lookup.
const LOOKUP_CHUNK: usize = 500;

/// A [`Backend`] over a single SQLite connection.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let conn = Connection::open(path).map_err(sql_error)?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(sql_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> Result<usize, BackendError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", sql::quote(table)), [], |r| {
                r.get(0)
            })
            .map_err(|e| table_error(table, e))?;
        Ok(count as usize)
    }

    /// Read a table's rows, converting values by column kind.
    pub fn rows(&self, table: &TableDef) -> Result<Vec<Row>, BackendError> {
        let columns: Vec<_> = table.ordered_columns();
        let names: Vec<String> = columns.iter().map(|c| sql::quote(&c.name)).collect();
        let query = format!(
            "SELECT {} FROM {} ORDER BY rowid",
            names.join(", "),
            sql::quote(&table.name)
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&query).map_err(|e| table_error(&table.name, e))?;
        let mut result = stmt.query([]).map_err(sql_error)?;
        let mut rows = Vec::new();
        while let Some(r) = result.next().map_err(sql_error)? {
            let mut row = Row::new(table.name.clone());
            for (i, column) in columns.iter().enumerate() {
                let value = r.get_ref(i).map_err(sql_error)?;
                row.set(column.name.clone(), sql::from_sql(value, Some(column.kind)));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Number of columns making up a table's primary key, if the table exists.
    fn key_width(conn: &Connection, table: &str) -> Result<Option<usize>, BackendError> {
        let mut stmt = conn
            .prepare("SELECT pk FROM pragma_table_info(?1)")
            .map_err(sql_error)?;
        let flags: Vec<i64> = stmt
            .query_map([table], |r| r.get(0))
            .map_err(sql_error)?
            .collect::<Result<_, _>>()
            .map_err(sql_error)?;
        if flags.is_empty() {
            return Ok(None);
        }
        Ok(Some(flags.iter().filter(|&&pk| pk > 0).count()))
    }

    /// First foreign-key violation left in `table`, as (child table, parent table).
    fn first_violation(
        tx: &Transaction<'_>,
        table: Option<&str>,
    ) -> Result<Option<(String, String)>, BackendError> {
        let query = match table {
            Some(t) => format!("PRAGMA foreign_key_check({})", sql::quote(t)),
            None => "PRAGMA foreign_key_check".to_string(),
        };
        let mut stmt = tx.prepare(&query).map_err(sql_error)?;
        let mut rows = stmt.query([]).map_err(sql_error)?;
        match rows.next().map_err(sql_error)? {
            Some(r) => Ok(Some((
                r.get::<_, String>(0).map_err(sql_error)?,
                r.get::<_, String>(2).map_err(sql_error)?,
            ))),
            None => Ok(None),
        }
    }

    fn write_rows(conn: &mut Connection, table: &TableDef, rows: &[Row]) -> Result<(), BackendError> {
        let tx = conn.transaction().map_err(sql_error)?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .map_err(sql_error)?;
        {
            let mut stmt = tx
                .prepare(&sql::upsert(table))
                .map_err(|e| table_error(&table.name, e))?;
            for row in rows {
                stmt.execute(params_from_iter(sql::row_params(table, row)))
                    .map_err(sql_error)?;
            }
        }

        if let Some((_, parent)) = Self::first_violation(&tx, Some(table.name.as_str()))? {
            let column = table
                .relations
                .iter()
                .find(|r| r.to_table == parent)
                .map(|r| r.from_column.clone())
                .unwrap_or_default();
            return Err(BackendError::ForeignKeyViolation {
                table: table.name.clone(),
                column,
                references: parent,
            });
        }
        tx.commit().map_err(sql_error)
    }
}

fn sql_error(e: rusqlite::Error) -> BackendError {
    BackendError::Sql(e.to_string())
}

fn table_error(table: &str, e: rusqlite::Error) -> BackendError {
    if e.to_string().contains("no such table") {
        BackendError::TableNotFound(table.to_string())
    } else {
        sql_error(e)
    }
}

impl Backend for SqliteBackend {
    fn table_names(&self) -> Result<Vec<String>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(sql_error)?;
        let names = stmt
            .query_map([], |r| r.get(0))
            .map_err(sql_error)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(sql_error)?;
        Ok(names)
    }

    fn create_table(&self, table: &TableDef) -> Result<(), BackendError> {
        let conn = self.conn.lock();

        // SQLite needs a foreign key to cover the whole parent key.
        let mut skip_fk = Vec::new();
        for relation in &table.relations {
            let width = if relation.is_self_referencing() {
                table.primary_key.len()
            } else {
                Self::key_width(&conn, &relation.to_table)?
                    .ok_or_else(|| BackendError::TableNotFound(relation.to_table.clone()))?
            };
            if width != 1 {
                skip_fk.push(relation.from_column.as_str());
            }
        }

        let mut ddl = vec![sql::create_table(table, &skip_fk)];
        ddl.extend(sql::create_indexes(table));
        conn.execute_batch(&ddl.join(";\n")).map_err(sql_error)?;
        debug!(table = %table.name, "sqlite table ready");
        Ok(())
    }

    fn upsert_rows(&self, table: &TableDef, rows: &[Row]) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        Self::write_rows(&mut conn, table, rows).map_err(|cause| BackendError::PartialUpsert {
            table: table.name.clone(),
            applied: 0,
            failed: rows.to_vec(),
            cause: Box::new(cause),
        })
    }

    fn delete_rows(&self, table: &TableDef, keys: &[PrimaryKey]) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_error)?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .map_err(sql_error)?;
        {
            let mut stmt = tx
                .prepare(&sql::delete_by_key(table))
                .map_err(|e| table_error(&table.name, e))?;
            for key in keys {
                stmt.execute(params_from_iter(key.values().iter().map(sql::to_sql)))
                    .map_err(sql_error)?;
            }
        }

        if let Some((child, _)) = Self::first_violation(&tx, None)? {
            return Err(BackendError::StillReferenced {
                table: table.name.clone(),
                referenced_by: child,
            });
        }
        tx.commit().map_err(sql_error)
    }

    fn drop_table(&self, table: &str) -> Result<(), BackendError> {
        let names = self.table_names()?;
        let conn = self.conn.lock();
        for other in names.iter().filter(|n| n.as_str() != table) {
            let mut stmt = conn
                .prepare("SELECT \"table\" FROM pragma_foreign_key_list(?1)")
                .map_err(sql_error)?;
            let parents = stmt
                .query_map([other], |r| r.get::<_, String>(0))
                .map_err(sql_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_error)?;
            if parents.iter().any(|p| p == table) {
                return Err(BackendError::StillReferenced {
                    table: table.to_string(),
                    referenced_by: other.clone(),
                });
            }
        }

        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", sql::quote(table)))
            .map_err(sql_error)?;
        debug!(table = %table, "sqlite table dropped");
        Ok(())
    }

    fn referencing_keys(
        &self,
        child: &TableDef,
        column: &str,
        values: &[Value],
    ) -> Result<Vec<PrimaryKey>, BackendError> {
        let kinds: Vec<_> = child
            .primary_key
            .iter()
            .map(|k| child.column_kind(k))
            .collect();
        let conn = self.conn.lock();
        let mut keys = Vec::new();

        for chunk in values.chunks(LOOKUP_CHUNK) {
            let query = sql::select_referencing(child, column, chunk.len());
            let mut stmt = conn.prepare(&query).map_err(|e| table_error(&child.name, e))?;
            let mut rows = stmt
                .query(params_from_iter(chunk.iter().map(sql::to_sql)))
                .map_err(sql_error)?;
            while let Some(r) = rows.next().map_err(sql_error)? {
                let mut parts = Vec::with_capacity(kinds.len());
                for (i, kind) in kinds.iter().enumerate() {
                    parts.push(sql::from_sql(r.get_ref(i).map_err(sql_error)?, *kind));
                }
                keys.push(PrimaryKey::new(parts));
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

impl QueryBackend for SqliteBackend {
    fn execute_query(&self, query: &str) -> Result<Vec<Row>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(query).map_err(sql_error)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut result = stmt.query([]).map_err(sql_error)?;

        let mut rows = Vec::new();
        while let Some(r) = result.next().map_err(sql_error)? {
            let mut row = Row::new("query");
            for (i, name) in names.iter().enumerate() {
                row.set(name.clone(), sql::from_sql(r.get_ref(i).map_err(sql_error)?, None));
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

impl ResultStore for SqliteBackend {
    /// Replace the table `identifier` with the result rows.
    ///
    /// Column types are inferred from the first non-null value. An empty
    /// result only removes the previous table.
    fn store_result(&self, identifier: &str, rows: &[Row]) -> Result<(), BackendError> {
        let mut columns: Vec<&str> = Vec::new();
        for row in rows {
            for column in row.columns() {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_error)?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", sql::quote(identifier)))
            .map_err(sql_error)?;

        if !columns.is_empty() {
            let defs: Vec<String> = columns
                .iter()
                .map(|c| format!("{} {}", sql::quote(c), sql::inferred_type(c, rows)))
                .collect();
            tx.execute_batch(&format!(
                "CREATE TABLE {} ({})",
                sql::quote(identifier),
                defs.join(", ")
            ))
            .map_err(sql_error)?;

            let names: Vec<String> = columns.iter().map(|c| sql::quote(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let insert = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                sql::quote(identifier),
                names.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&insert).map_err(sql_error)?;
            for row in rows {
                let params = columns
                    .iter()
                    .map(|c| row.get(c).map_or(rusqlite::types::Value::Null, sql::to_sql));
                stmt.execute(params_from_iter(params)).map_err(sql_error)?;
            }
        }

        tx.commit().map_err(sql_error)?;
        debug!(result = %identifier, rows = rows.len(), "query result stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemasync_core::{
        ColumnDef, ColumnKind, LifecycleEngine, QueryJob, QueryRunner, SchemaModel,
    };
    use std::collections::BTreeMap;

    fn schema() -> SchemaModel {
        let patient = TableDef::new("patient")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("enrolled", ColumnKind::Date))
            .with_primary_key(["id"]);
        let sample = TableDef::new("sample")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_column(ColumnDef::new("patient_id", ColumnKind::String).with_index())
            .with_column(ColumnDef::new("parent_id", ColumnKind::String))
            .with_column(ColumnDef::new("frozen", ColumnKind::Boolean))
            .with_primary_key(["id"])
            .with_relation("patient_id", "patient", "id")
            .with_relation("parent_id", "sample", "id");
        SchemaModel::new(vec![patient, sample]).unwrap()
    }

    fn rows() -> BTreeMap<String, Vec<Row>> {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let mut map = BTreeMap::new();
        map.insert(
            "patient".to_string(),
            vec![
                Row::new("patient").with("id", "P1").with("enrolled", date),
                Row::new("patient").with("id", "P2"),
            ],
        );
        map.insert(
            "sample".to_string(),
            vec![
                Row::new("sample")
                    .with("id", "S2")
                    .with("patient_id", "P1")
                    .with("parent_id", "S1"),
                Row::new("sample")
                    .with("id", "S1")
                    .with("patient_id", "P1")
                    .with("frozen", true),
                Row::new("sample").with("id", "S3").with("patient_id", "P2"),
            ],
        );
        map
    }

    fn populated() -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let engine = LifecycleEngine::new(&backend);
        engine.build(&schema()).unwrap();
        engine.reconcile(&schema(), rows()).unwrap();
        backend
    }

    #[test]
    fn test_build_and_reconcile() {
        let backend = populated();
        assert_eq!(backend.table_names().unwrap(), vec!["patient", "sample"]);
        assert_eq!(backend.row_count("sample").unwrap(), 3);

        let schema = schema();
        let patients = backend.rows(schema.get_table("patient").unwrap()).unwrap();
        assert!(matches!(patients[0].get("enrolled"), Some(Value::Date(_))));
        let samples = backend.rows(schema.get_table("sample").unwrap()).unwrap();
        let s1 = samples
            .iter()
            .find(|r| r.get("id") == Some(&Value::from("S1")))
            .unwrap();
        assert_eq!(s1.get("frozen"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_upsert_overwrites() {
        let backend = populated();
        let schema = schema();
        let mut update = BTreeMap::new();
        update.insert(
            "patient".to_string(),
            vec![Row::new("patient").with("id", "P2").with("enrolled", "2020-01-01")],
        );
        LifecycleEngine::new(&backend).reconcile(&schema, update).unwrap();

        assert_eq!(backend.row_count("patient").unwrap(), 2);
        let patients = backend.rows(schema.get_table("patient").unwrap()).unwrap();
        let p2 = patients
            .iter()
            .find(|r| r.get("id") == Some(&Value::from("P2")))
            .unwrap();
        assert!(matches!(p2.get("enrolled"), Some(Value::Date(_))));
    }

    #[test]
    fn test_foreign_key_violation_reported() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let engine = LifecycleEngine::new(&backend);
        engine.build(&schema()).unwrap();

        let mut batch = BTreeMap::new();
        batch.insert(
            "sample".to_string(),
            vec![Row::new("sample").with("id", "S1").with("patient_id", "P9")],
        );
        let err = engine.reconcile(&schema(), batch).unwrap_err();

        assert_eq!(err.missing_dependency(), Some("patient"));
        assert_eq!(backend.row_count("sample").unwrap(), 0);
    }

    #[test]
    fn test_cascade_delete() {
        let backend = populated();
        let report = LifecycleEngine::new(&backend)
            .cascade_delete(&schema(), "patient", &[PrimaryKey::single("P1")])
            .unwrap();

        assert_eq!(report.plan.total_rows(), 3);
        assert_eq!(backend.row_count("patient").unwrap(), 1);
        assert_eq!(backend.row_count("sample").unwrap(), 1);
    }

    #[test]
    fn test_delete_restricted() {
        let backend = populated();
        let schema = schema();
        let err = backend
            .delete_rows(schema.get_table("patient").unwrap(), &[PrimaryKey::single("P2")])
            .unwrap_err();
        assert!(matches!(err, BackendError::StillReferenced { .. }));
        assert_eq!(backend.row_count("patient").unwrap(), 2);
    }

    #[test]
    fn test_drop_order() {
        let backend = populated();
        assert!(backend.drop_table("patient").is_err());

        let report = LifecycleEngine::new(&backend).drop_all(&schema()).unwrap();
        assert_eq!(report.dropped_tables, vec!["sample", "patient"]);
        assert!(backend.table_names().unwrap().is_empty());
    }

    #[test]
    fn test_query_results_replace_previous() {
        let backend = populated();
        let runner = QueryRunner::new(&backend, &backend);

        runner
            .run_all(&[QueryJob::new(
                "SELECT patient_id, COUNT(*) AS samples FROM sample GROUP BY patient_id",
                "sample_counts",
            )])
            .unwrap();
        assert_eq!(backend.row_count("sample_counts").unwrap(), 2);

        runner
            .run("SELECT id FROM patient WHERE id = 'P1'", "sample_counts")
            .unwrap();
        let rows = backend
            .execute_query("SELECT * FROM sample_counts")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::from("P1")));
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            let engine = LifecycleEngine::new(&backend);
            engine.build(&schema()).unwrap();
            engine.reconcile(&schema(), rows()).unwrap();
        }

        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(reopened.row_count("patient").unwrap(), 2);
    }
}
