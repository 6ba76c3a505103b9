//! Engine and synchronizer configuration.

/// Default number of rows per `upsert_rows` call.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Lifecycle engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows per `upsert_rows` call (at least 1).
    pub batch_size: usize,
    /// Whether to plan and order without issuing mutating backend calls.
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

impl EngineConfig {
    /// Set the upsert batch size. Zero is raised to 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Synchronizer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Only fetch manifests newer than this version.
    pub since_version: Option<u64>,
    /// Run a build pass before reconciling.
    pub build_missing_tables: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            since_version: None,
            build_missing_tables: true,
        }
    }
}

impl SyncConfig {
    /// Fetch only manifests newer than `version`.
    pub fn with_since_version(mut self, version: u64) -> Self {
        self.since_version = Some(version);
        self
    }

    /// Enable or disable the build pass.
    pub fn with_build(mut self, build: bool) -> Self {
        self.build_missing_tables = build;
        self
    }
}
