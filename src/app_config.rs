//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Without one, the defaults
//! serve an empty catalog to everyone.

use std::path::{Path, PathBuf};

use datacat::catalog::CatalogConfig;
use datacat::import::{DatasetEntry, ManifestImporter};
use datacat::privilege::{PrivilegeConfig, PrivilegeResolver};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

fn default_store_path() -> PathBuf {
    dirs::data_local_dir().map_or_else(
        || PathBuf::from("/var/lib/datacat"),
        |dir| dir.join("datacat"),
    )
}

/// Where the catalog keeps its state and temp results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// The datasets to serve: a manifest file, or inline `[[datasets.dataset]]` tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetsConfig {
    /// TOML file with `[[dataset]]` tables, re-read on every reload.
    #[serde(default)]
    pub manifest: Option<PathBuf>,

    #[serde(default, rename = "dataset")]
    pub entries: Vec<DatasetEntry>,
}

impl DatasetsConfig {
    /// Importer for this configuration.
    pub fn importer(&self) -> ManifestImporter {
        match &self.manifest {
            Some(path) => ManifestImporter::from_path(path),
            None => ManifestImporter::from_entries(self.entries.clone()),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub privileges: PrivilegeConfig,

    #[serde(default)]
    pub datasets: DatasetsConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` with every problem found otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.store.path.as_os_str().is_empty() {
            errors.push("Store path is empty.".to_owned());
        } else if self.store.path.is_relative() {
            errors.push(format!(
                "Store path '{}' must be absolute.",
                self.store.path.display()
            ));
        }

        if self.datasets.manifest.is_some() && !self.datasets.entries.is_empty() {
            errors.push(
                "Datasets may come from a manifest or from inline entries, not both.".to_owned(),
            );
        }

        if let Err(e) = PrivilegeResolver::from_config(&self.privileges) {
            errors.push(format!("Invalid privileges: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("datacat").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("datacat").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/datacat/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads and validates the config, falling back to defaults when no file exists.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match Self::load(external_config_path) {
            Some(res) => {
                let config = res?;
                debug!("Loaded configuration successfully.");
                config
            }
            None => {
                info!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
