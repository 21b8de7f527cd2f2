//! Collaborators that produce datasets and tell whether they changed.
//!
//! [`Importer`] turns some external description of the served data into [`DataHandle`]s.
//! [`FreshnessProbe`] is consulted on every dataset lookup to detect that the data behind a
//! handle moved on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::DataHandle;

/// Errors raised while importing datasets.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The manifest file could not be read.
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        /// Manifest file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid TOML or lacks required keys.
    #[error("Malformed manifest {path}: {source}")]
    Parse {
        /// Manifest file.
        path: PathBuf,
        /// Parser diagnostics.
        #[source]
        source: toml::de::Error,
    },

    /// The tool payload has no JSON representation.
    #[error("Dataset '{name}' has an unsupported tool-info payload: {source}")]
    ToolInfo {
        /// Dataset carrying the payload.
        name: String,
        /// Conversion failure.
        #[source]
        source: serde_json::Error,
    },

    /// A dataset name that is not an absolute path.
    #[error("Dataset name '{0}' must be an absolute path without a trailing '/'")]
    InvalidName(String),
}

/// Errors raised while checking or refreshing one dataset.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The source file could not be inspected.
    #[error("Failed to stat source {path} of dataset '{name}': {source}")]
    Io {
        /// Dataset being checked.
        name: String,
        /// Its source file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// Produces the full list of datasets the catalog should serve.
pub trait Importer: Send + Sync {
    /// Returns the datasets to serve.
    ///
    /// `loaded` are the handles the catalog holds now. Returning one of them unchanged (the
    /// same `Arc`) keeps it in place; anything not returned is removed.
    fn import(&self, loaded: &[Arc<DataHandle>]) -> Result<Vec<Arc<DataHandle>>, ImportError>;
}

/// Detects that a dataset's backing data changed since its handle was created.
pub trait FreshnessProbe: Send + Sync {
    /// Whether the data behind `data` changed after its `create_time`.
    fn is_stale(&self, data: &DataHandle) -> Result<bool, ProbeError>;

    /// Brings `data` up to date, advancing its `create_time`.
    fn reload(&self, data: &DataHandle) -> Result<(), ProbeError>;
}

/// Probe for catalogs whose datasets never change behind their back.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStale;

impl FreshnessProbe for NeverStale {
    fn is_stale(&self, _data: &DataHandle) -> Result<bool, ProbeError> {
        Ok(false)
    }

    fn reload(&self, _data: &DataHandle) -> Result<(), ProbeError> {
        Ok(())
    }
}

type SourceIndex = Arc<RwLock<FxHashMap<String, PathBuf>>>;

/// Treats a dataset as stale once its source file was modified after the handle's
/// `create_time`. Datasets without a registered source are always fresh.
#[derive(Debug, Default, Clone)]
pub struct MtimeProbe {
    sources: SourceIndex,
}

impl MtimeProbe {
    /// Creates a probe watching nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` as the backing file of dataset `name`.
    pub fn register(&self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.sources.write().insert(name.into(), path.into());
    }

    /// Stops watching every dataset not named in `keep`.
    pub fn retain(&self, keep: &FxHashSet<String>) {
        self.sources.write().retain(|name, _| keep.contains(name));
    }

    /// Whether a source file is registered for dataset `name`.
    #[must_use]
    pub fn is_watching(&self, name: &str) -> bool {
        self.sources.read().contains_key(name)
    }

    fn source_mtime(&self, data: &DataHandle) -> Result<Option<SystemTime>, ProbeError> {
        let Some(path) = self.sources.read().get(data.complete_name()).cloned() else {
            return Ok(None);
        };
        std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(Some)
            .map_err(|source| ProbeError::Io {
                name: data.complete_name().to_owned(),
                path,
                source,
            })
    }
}

impl FreshnessProbe for MtimeProbe {
    fn is_stale(&self, data: &DataHandle) -> Result<bool, ProbeError> {
        Ok(self
            .source_mtime(data)?
            .is_some_and(|mtime| mtime > data.create_time()))
    }

    fn reload(&self, data: &DataHandle) -> Result<(), ProbeError> {
        if let Some(mtime) = self.source_mtime(data)? {
            debug!(name = data.complete_name(), "Dataset source changed, refreshing.");
            data.touch(mtime);
        }
        Ok(())
    }
}

/// One dataset of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetEntry {
    /// Catalog path, e.g. `/ocean/sst/monthly.nc`.
    pub name: String,

    /// Free-form text shown in listings.
    #[serde(default)]
    pub description: String,

    /// Opaque payload handed to the extraction tool.
    #[serde(default)]
    pub tool_info: Option<toml::Value>,

    /// File backing the dataset, watched for modifications.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default, rename = "dataset")]
    datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Clone)]
enum ManifestSource {
    Inline(Vec<DatasetEntry>),
    File(PathBuf),
}

/// Importer driven by a TOML list of `[[dataset]]` tables.
///
/// A manifest file is re-read on every import, so a reload picks up edits. Loaded handles whose
/// description and tool payload are unchanged are handed back as-is.
#[derive(Debug, Clone)]
pub struct ManifestImporter {
    source: ManifestSource,
    probe: MtimeProbe,
}

impl ManifestImporter {
    /// Imports from a manifest file.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ManifestSource::File(path.into()),
            probe: MtimeProbe::new(),
        }
    }

    /// Imports a fixed list.
    #[must_use]
    pub fn from_entries(entries: Vec<DatasetEntry>) -> Self {
        Self {
            source: ManifestSource::Inline(entries),
            probe: MtimeProbe::new(),
        }
    }

    /// Registers sources with `probe` instead of a private one, so that a replacement importer
    /// keeps feeding the probe an existing catalog was opened with.
    #[must_use]
    pub fn with_probe(mut self, probe: MtimeProbe) -> Self {
        self.probe = probe;
        self
    }

    /// A probe watching the `source` files of every imported dataset.
    #[must_use]
    pub fn mtime_probe(&self) -> MtimeProbe {
        self.probe.clone()
    }

    fn entries(&self) -> Result<Vec<DatasetEntry>, ImportError> {
        match &self.source {
            ManifestSource::Inline(entries) => Ok(entries.clone()),
            ManifestSource::File(path) => read_manifest(path),
        }
    }
}

fn read_manifest(path: &Path) -> Result<Vec<DatasetEntry>, ImportError> {
    debug!(path = ?path, "Reading dataset manifest.");
    let content = std::fs::read_to_string(path).map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest: Manifest = toml::from_str(&content).map_err(|source| ImportError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(manifest.datasets)
}

fn valid_name(name: &str) -> bool {
    name.len() > 1 && name.starts_with('/') && !name.ends_with('/') && !name.contains("//")
}

fn entry_tool_info(entry: &DatasetEntry) -> Result<serde_json::Value, ImportError> {
    if !valid_name(&entry.name) {
        return Err(ImportError::InvalidName(entry.name.clone()));
    }
    match &entry.tool_info {
        Some(value) => serde_json::to_value(value).map_err(|source| ImportError::ToolInfo {
            name: entry.name.clone(),
            source,
        }),
        None => Ok(serde_json::Value::Null),
    }
}

impl Importer for ManifestImporter {
    /// Fails only when the manifest as a whole cannot be read. Individual entries that are
    /// malformed are logged and left out.
    fn import(&self, loaded: &[Arc<DataHandle>]) -> Result<Vec<Arc<DataHandle>>, ImportError> {
        let existing: FxHashMap<&str, &Arc<DataHandle>> =
            loaded.iter().map(|d| (d.complete_name(), d)).collect();

        let entries = self.entries()?;
        let mut out = Vec::with_capacity(entries.len());
        let mut watched = FxHashSet::default();
        let mut reused = 0usize;
        for entry in entries {
            let tool_info = match entry_tool_info(&entry) {
                Ok(tool_info) => tool_info,
                Err(e) => {
                    warn!(name = %entry.name, error = %e, "Skipping dataset.");
                    continue;
                }
            };
            if let Some(path) = &entry.source {
                self.probe.register(entry.name.clone(), path.clone());
                watched.insert(entry.name.clone());
            }

            match existing.get(entry.name.as_str()) {
                Some(current)
                    if current.description() == entry.description
                        && current.tool_info() == tool_info =>
                {
                    reused += 1;
                    out.push(Arc::clone(current));
                }
                _ => out.push(Arc::new(
                    DataHandle::new(entry.name, entry.description).with_tool_info(tool_info),
                )),
            }
        }
        self.probe.retain(&watched);
        info!(datasets = out.len(), reused, "Imported dataset manifest.");
        Ok(out)
    }
}
