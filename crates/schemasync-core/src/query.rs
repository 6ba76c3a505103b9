//! Query runner.
//!
//! Executes opaque queries against a built schema and stores each result
//! under a caller-chosen name.

use crate::backend::{QueryBackend, ResultStore};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, info_span};

/// A query and the name its result is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJob {
    /// Query text, passed to the backend unchanged.
    pub query: String,
    /// Identifier the result rows are stored under.
    #[serde(alias = "table_name")]
    pub result_name: String,
}

impl QueryJob {
    /// Create a job.
    pub fn new(query: impl Into<String>, result_name: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            result_name: result_name.into(),
        }
    }
}

/// Runs queries and hands their rows to a result store.
pub struct QueryRunner<'a, Q: QueryBackend + ?Sized, R: ResultStore + ?Sized> {
    backend: &'a Q,
    store: &'a R,
}

impl<'a, Q: QueryBackend + ?Sized, R: ResultStore + ?Sized> QueryRunner<'a, Q, R> {
    /// Create a runner.
    pub fn new(backend: &'a Q, store: &'a R) -> Self {
        Self { backend, store }
    }

    /// Run one query and store its rows. Returns the row count.
    pub fn run(&self, query: &str, identifier: &str) -> Result<usize, Error> {
        let span = info_span!("query", result = %identifier);
        let _enter = span.enter();
        let start = Instant::now();

        let rows = self
            .backend
            .execute_query(query)
            .and_then(|rows| self.store.store_result(identifier, &rows).map(|()| rows))
            .map_err(|source| Error::Query {
                identifier: identifier.to_string(),
                source,
            })?;

        info!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query stored"
        );
        Ok(rows.len())
    }

    /// Run jobs in order, stopping at the first failure.
    pub fn run_all(&self, jobs: &[QueryJob]) -> Result<Vec<(String, usize)>, Error> {
        jobs.iter()
            .map(|job| {
                self.run(&job.query, &job.result_name)
                    .map(|count| (job.result_name.clone(), count))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::catalog::{ColumnDef, ColumnKind, TableDef};
    use crate::value::Row;

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        let table = TableDef::new("patient")
            .with_column(ColumnDef::required("id", ColumnKind::String))
            .with_primary_key(["id"]);
        backend.create_table(&table).unwrap();
        backend
            .upsert_rows(
                &table,
                &[Row::new("patient").with("id", "P1"), Row::new("patient").with("id", "P2")],
            )
            .unwrap();
        backend
    }

    #[test]
    fn test_run_stores_result() {
        let backend = backend();
        let count = QueryRunner::new(&backend, &backend)
            .run("patient", "patients")
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(backend.result("patients").map(|r| r.len()), Some(2));
    }

    #[test]
    fn test_run_all_stops_on_failure() {
        let backend = backend();
        let jobs = vec![
            QueryJob::new("patient", "first"),
            QueryJob::new("missing", "second"),
            QueryJob::new("patient", "third"),
        ];

        let err = QueryRunner::new(&backend, &backend).run_all(&jobs).unwrap_err();
        assert!(matches!(err, Error::Query { ref identifier, .. } if identifier == "second"));
        assert!(backend.result("first").is_some());
        assert!(backend.result("third").is_none());
    }

    #[test]
    fn test_job_accepts_table_name_alias() {
        let jobs: Vec<QueryJob> =
            serde_json::from_str(r#"[{"query": "patient", "table_name": "out"}]"#).unwrap();
        assert_eq!(jobs[0], QueryJob::new("patient", "out"));
    }
}
