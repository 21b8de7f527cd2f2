//! On-disk form of the catalog: the dataset tree and the temp FIFO as JSON documents.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::handle::{DataHandle, TempHandle};
use crate::store::BlobStore;

/// Owner key of the catalog's documents in the blob store.
pub const OWNER: &str = "catalog";
/// Dataset tree, rewritten after each reconfiguration.
pub const DATASETS_ENTRY: &str = "datasets.json";
/// Temp FIFO in age order, rewritten after each add or eviction.
pub const TEMPS_ENTRY: &str = "temp_entries.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DatasetRecord {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tool_info: serde_json::Value,
    create_time: SystemTime,
}

impl DatasetRecord {
    pub(crate) fn capture(data: &DataHandle) -> Self {
        Self {
            name: data.complete_name().to_owned(),
            description: data.description(),
            tool_info: data.tool_info(),
            create_time: data.create_time(),
        }
    }

    pub(crate) fn restore(self) -> DataHandle {
        DataHandle::new(self.name, self.description)
            .with_tool_info(self.tool_info)
            .with_create_time(self.create_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct TempRecord {
    datasets: Vec<DatasetRecord>,
    create_time: SystemTime,
    storage_size: u64,
    #[serde(default)]
    dependencies: BTreeSet<String>,
    #[serde(default)]
    storage: Vec<PathBuf>,
}

impl TempRecord {
    pub(crate) fn capture(temp: &TempHandle) -> Self {
        Self {
            datasets: temp
                .datasets()
                .iter()
                .map(|d| DatasetRecord::capture(d))
                .collect(),
            create_time: temp.create_time(),
            storage_size: temp.storage_size(),
            dependencies: temp.dependencies().clone(),
            storage: temp.storage().to_vec(),
        }
    }

    /// Rebuilds the entry, or `None` if part of its storage no longer exists.
    pub(crate) fn restore(self) -> Option<TempHandle> {
        if let Some(missing) = self.storage.iter().find(|p| !p.exists()) {
            debug!(path = ?missing, "Dropping persisted temp entry with missing storage.");
            return None;
        }
        let datasets = self
            .datasets
            .into_iter()
            .map(|r| Arc::new(r.restore()))
            .collect();
        Some(
            TempHandle::new(datasets)
                .with_dependencies(self.dependencies)
                .with_storage(self.storage)
                .with_storage_size(self.storage_size)
                .with_create_time(self.create_time),
        )
    }
}

/// Writes `records` as one JSON document. Failures are logged; the catalog keeps running in
/// memory.
pub(crate) fn save<T: Serialize>(store: &BlobStore, entry: &str, records: &[T]) {
    let bytes = match serde_json::to_vec_pretty(records) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(entry, error = %e, "Failed to encode catalog state.");
            return;
        }
    };
    if let Err(e) = store.write(OWNER, entry, &bytes) {
        warn!(entry, error = %e, "Failed to persist catalog state.");
    }
}

/// Reads a document written by [`save`]. Missing or unreadable state is an empty list.
pub(crate) fn load<T: DeserializeOwned>(store: &BlobStore, entry: &str) -> Vec<T> {
    match store.read(OWNER, entry) {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                warn!(entry, error = %e, "Ignoring corrupt catalog state.");
                Vec::new()
            }
        },
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(entry, error = %e, "Failed to read catalog state.");
            Vec::new()
        }
    }
}
