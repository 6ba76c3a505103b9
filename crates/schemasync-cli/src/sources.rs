//! File-backed schema and manifest sources.

use schemasync_core::{Error, ManifestSource, Row, SchemaModel, SchemaSource, SourceError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

fn read(path: &Path) -> Result<String, SourceError> {
    fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Schemas stored as JSON documents in a directory.
///
/// `fetch_schema("clinical")` reads `clinical.json`, or a file named exactly
/// `clinical` when no such document exists.
#[derive(Debug, Clone)]
pub struct JsonSchemaSource {
    root: PathBuf,
}

impl JsonSchemaSource {
    /// Create a source reading from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a source for a single schema file, returning it with its identifier.
    pub fn for_file(path: &Path) -> Result<(Self, String), SourceError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SourceError::NotFound(path.display().to_string()))?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok((Self::new(root), name.to_string()))
    }

    fn locate(&self, identifier: &str) -> Result<PathBuf, SourceError> {
        let document = self.root.join(format!("{identifier}.json"));
        if document.is_file() {
            return Ok(document);
        }
        let exact = self.root.join(identifier);
        if exact.is_file() {
            return Ok(exact);
        }
        Err(SourceError::NotFound(document.display().to_string()))
    }
}

impl SchemaSource for JsonSchemaSource {
    fn fetch_schema(&self, identifier: &str) -> Result<SchemaModel, Error> {
        let path = self.locate(identifier)?;
        let schema = SchemaModel::from_json(&read(&path)?)?;
        debug!(path = %path.display(), tables = schema.len(), "schema loaded");
        Ok(schema)
    }
}

/// Manifests stored as JSON files in a directory.
///
/// A table's manifests are `<table>.json` and `<table>.<label>.json`, each
/// holding an array of objects. When `<label>` is a number it is the
/// manifest's version, and versions at or below `since_version` are skipped.
/// Manifests are read in file-name order and concatenated.
#[derive(Debug, Clone)]
pub struct DirectoryManifestSource {
    root: PathBuf,
}

impl DirectoryManifestSource {
    /// Create a source reading from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Manifest files for `table`, sorted by name.
    fn manifests(&self, table: &str, since_version: Option<u64>) -> Result<Vec<PathBuf>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::NotFound(self.root.display().to_string()));
        }
        let entries = fs::read_dir(&self.root).map_err(|source| SourceError::Io {
            path: self.root.display().to_string(),
            source,
        })?;

        let prefix = format!("{table}.");
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: self.root.display().to_string(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let label = match stem.strip_prefix(&prefix) {
                Some(label) => label,
                None if stem == table => "",
                None => continue,
            };
            if let (Some(since), Ok(version)) = (since_version, label.parse::<u64>()) {
                if version <= since {
                    continue;
                }
            }
            if entry.path().is_file() {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}

impl ManifestSource for DirectoryManifestSource {
    fn fetch_rows(&self, table: &str, since_version: Option<u64>) -> Result<Vec<Row>, SourceError> {
        let mut rows = Vec::new();
        for path in self.manifests(table, since_version)? {
            let parse_error = |reason: String| SourceError::Parse {
                path: path.display().to_string(),
                reason,
            };
            let document: Vec<serde_json::Value> =
                serde_json::from_str(&read(&path)?).map_err(|e| parse_error(e.to_string()))?;

            let before = rows.len();
            for (i, item) in document.into_iter().enumerate() {
                match item {
                    serde_json::Value::Object(object) => {
                        rows.push(Row::from_json_object(table, object))
                    }
                    other => {
                        return Err(parse_error(format!("entry {i} is not an object: {other}")))
                    }
                }
            }
            debug!(table = %table, path = %path.display(), rows = rows.len() - before, "manifest read");
        }
        Ok(rows)
    }
}
