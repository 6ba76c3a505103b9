//! schemasync - synchronize manifests into a SQLite database.

mod config;
mod error;
mod sources;

use clap::Parser;
use schemasync_core::{
    normalize_rows, DependencyGraph, Error, LifecycleEngine, PrimaryKey, QueryJob, QueryRunner,
    Row, SchemaModel, SchemaSource, SourceError, Synchronizer, TableDef,
};
use schemasync_sqlite::SqliteBackend;
use std::fs;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Args, CliConfig, Command};
use crate::error::CliError;
use crate::sources::{DirectoryManifestSource, JsonSchemaSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schemasync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Args::parse().into_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        schema = %config.schema_path.display(),
        database = %config.database_path.display(),
        batch_size = config.engine.batch_size,
        dry_run = config.engine.dry_run,
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received shutdown signal, stopping after the current step");
        signal.cancel();
    });

    match tokio::task::spawn_blocking(move || run(&config, cancel)).await? {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            Err(e.into())
        }
    }
}

fn run(config: &CliConfig, cancel: CancellationToken) -> Result<(), CliError> {
    let (source, identifier) = JsonSchemaSource::for_file(&config.schema_path)?;
    let schema = source.fetch_schema(&identifier)?;

    match &config.command {
        Command::Order { ranks } => print_order(&schema, *ranks)?,

        Command::Build => {
            let backend = SqliteBackend::open(&config.database_path)?;
            let report = engine(&backend, config, cancel).build(&schema)?;
            println!(
                "{} {} table(s): {}",
                verb("created", report.dry_run),
                report.created_tables.len(),
                report.created_tables.join(", ")
            );
        }

        Command::Sync { manifests, .. } => {
            let backend = SqliteBackend::open(&config.database_path)?;
            let source = DirectoryManifestSource::new(manifests);
            let report = Synchronizer::new(&source, engine(&backend, config, cancel))
                .with_config(config.sync_config().unwrap_or_default())
                .sync(&schema)?;
            for table in &report.reconcile.tables {
                println!(
                    "{}: {} row(s), {} duplicate(s) dropped",
                    table.table, table.rows, table.duplicates_dropped
                );
            }
            for table in &report.skipped_tables {
                println!("{table}: skipped");
            }
            println!(
                "{} {} of {} fetched row(s)",
                verb("upserted", report.reconcile.dry_run),
                report.reconcile.total_rows(),
                report.fetched_rows
            );
        }

        Command::Delete { table, keys } => {
            let keys = parse_keys(schema.table(table)?, keys)?;
            let backend = SqliteBackend::open(&config.database_path)?;
            let report = engine(&backend, config, cancel).cascade_delete(&schema, table, &keys)?;
            for (table, keys) in &report.plan.deletions {
                println!("{table}: {} row(s)", keys.len());
            }
            println!(
                "{} {} row(s)",
                verb("deleted", report.dry_run),
                report.plan.total_rows()
            );
        }

        Command::Drop { tables, all } => {
            let backend = SqliteBackend::open(&config.database_path)?;
            let engine = engine(&backend, config, cancel);
            let report = if *all {
                engine.drop_all(&schema)?
            } else {
                engine.drop_tables(&schema, tables)?
            };
            println!(
                "{} {} table(s): {}",
                verb("dropped", report.dry_run),
                report.dropped_tables.len(),
                report.dropped_tables.join(", ")
            );
        }

        Command::Query { sql, into, jobs } => {
            let backend = SqliteBackend::open(&config.database_path)?;
            let runner = QueryRunner::new(&backend, &backend);
            let results = match (jobs, sql, into) {
                (Some(path), _, _) => {
                    let text = fs::read_to_string(path).map_err(|source| SourceError::Io {
                        path: path.display().to_string(),
                        source,
                    })?;
                    let jobs: Vec<QueryJob> =
                        serde_json::from_str(&text).map_err(|e| SourceError::Parse {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        })?;
                    runner.run_all(&jobs)?
                }
                (None, Some(sql), Some(into)) => vec![(into.clone(), runner.run(sql, into)?)],
                _ => Vec::new(),
            };
            for (name, rows) in results {
                println!("{name}: {rows} row(s)");
            }
        }
    }
    Ok(())
}

fn engine<'a>(
    backend: &'a SqliteBackend,
    config: &CliConfig,
    cancel: CancellationToken,
) -> LifecycleEngine<'a, SqliteBackend> {
    LifecycleEngine::new(backend)
        .with_config(config.engine.clone())
        .with_cancel_token(cancel)
}

fn verb(done: &str, dry_run: bool) -> String {
    if dry_run {
        format!("would have {done}")
    } else {
        done.to_string()
    }
}

fn print_order(schema: &SchemaModel, ranks: bool) -> Result<(), Error> {
    let graph = DependencyGraph::build(schema)?;
    if ranks {
        for (depth, group) in graph.ranks().iter().enumerate() {
            println!("{depth}: {}", group.join(", "));
        }
    } else {
        for table in graph.topological_order() {
            println!("{table}");
        }
    }
    Ok(())
}

/// Convert command-line keys into primary keys of `table`.
///
/// Composite key values are comma-separated in key column order. Values
/// are coerced to the key columns' kinds.
fn parse_keys(table: &TableDef, raw: &[String]) -> Result<Vec<PrimaryKey>, CliError> {
    if !table.has_primary_key() {
        return Err(Error::NoPrimaryKey {
            table: table.name.clone(),
        }
        .into());
    }

    let mut rows = Vec::with_capacity(raw.len());
    for key in raw {
        let parts: Vec<&str> = key.split(',').map(str::trim).collect();
        if parts.len() != table.primary_key.len() {
            return Err(CliError::InvalidKey {
                table: table.name.clone(),
                key: key.clone(),
                expected: table.primary_key.len(),
            });
        }
        let row = table
            .primary_key
            .iter()
            .zip(parts)
            .fold(Row::new(table.name.clone()), |row, (column, part)| {
                row.with(column.clone(), part)
            });
        rows.push(row);
    }

    Ok(normalize_rows(table, rows)?
        .iter()
        .filter_map(|row| row.key(&table.primary_key))
        .collect())
}
