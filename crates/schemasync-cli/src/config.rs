//! Command-line configuration.

use clap::{Parser, Subcommand};
use schemasync_core::config::DEFAULT_BATCH_SIZE;
use schemasync_core::{EngineConfig, SyncConfig};
use std::path::PathBuf;

/// Default schema document path.
pub const DEFAULT_SCHEMA_PATH: &str = "schema.json";

/// Default SQLite database path.
pub const DEFAULT_DATABASE_PATH: &str = "schemasync.db";

/// Default manifest directory.
pub const DEFAULT_MANIFEST_DIR: &str = "manifests";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "schemasync")]
#[command(version, about = "Synchronize manifests into a relational schema", long_about = None)]
pub struct Args {
    /// Path to the JSON schema document.
    #[arg(short, long, global = true, default_value = DEFAULT_SCHEMA_PATH)]
    pub schema: PathBuf,

    /// Path to the SQLite database file.
    #[arg(short, long, global = true, default_value = DEFAULT_DATABASE_PATH)]
    pub database: PathBuf,

    /// Rows per upsert or delete call.
    #[arg(long, global = true, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Plan and log every step without changing the database.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Operations the binary can run.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print tables in dependency order.
    Order {
        /// Print tables grouped by dependency depth.
        #[arg(long)]
        ranks: bool,
    },

    /// Create every table of the schema.
    Build,

    /// Load manifests and reconcile them into the database.
    Sync {
        /// Directory holding `<table>.json` and `<table>.<version>.json` manifests.
        #[arg(short, long, default_value = DEFAULT_MANIFEST_DIR)]
        manifests: PathBuf,

        /// Only read manifests with a version above this one.
        #[arg(long)]
        since_version: Option<u64>,

        /// Do not create missing tables first.
        #[arg(long)]
        no_build: bool,
    },

    /// Delete rows and everything that references them.
    Delete {
        /// Table the rows belong to.
        table: String,

        /// Primary keys; composite key values are comma-separated.
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Drop tables.
    Drop {
        /// Tables to drop.
        #[arg(required_unless_present = "all")]
        tables: Vec<String>,

        /// Drop every table of the schema.
        #[arg(long, conflicts_with = "tables")]
        all: bool,
    },

    /// Run queries and store their results as tables.
    Query {
        /// Query text.
        #[arg(long, requires = "into", conflicts_with = "jobs")]
        sql: Option<String>,

        /// Table the query result is stored in.
        #[arg(long, requires = "sql")]
        into: Option<String>,

        /// JSON file with an array of `{"query", "result_name"}` jobs.
        #[arg(long, required_unless_present = "sql")]
        jobs: Option<PathBuf>,
    },
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Path to the JSON schema document.
    pub schema_path: PathBuf,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Engine settings shared by every command.
    pub engine: EngineConfig,
    /// Command to run.
    pub command: Command,
}

impl CliConfig {
    /// Sync settings, if the command is `sync`.
    pub fn sync_config(&self) -> Option<SyncConfig> {
        match &self.command {
            Command::Sync {
                since_version,
                no_build,
                ..
            } => {
                let mut config = SyncConfig::default().with_build(!no_build);
                if let Some(version) = since_version {
                    config = config.with_since_version(*version);
                }
                Some(config)
            }
            _ => None,
        }
    }
}

impl Args {
    /// Convert arguments into the invocation configuration.
    pub fn into_config(self) -> CliConfig {
        CliConfig {
            schema_path: self.schema,
            database_path: self.database,
            engine: EngineConfig::default()
                .with_batch_size(self.batch_size)
                .with_dry_run(self.dry_run),
            command: self.command,
        }
    }
}
