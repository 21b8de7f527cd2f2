//! Catalog entries: datasets, directories and temporary derived results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::lock::PriorityLock;

/// A node of the catalog tree.
#[derive(Debug, Clone)]
pub enum Handle {
    /// A served dataset.
    Data(Arc<DataHandle>),
    /// A directory of further handles.
    Dir(Arc<DirHandle>),
}

impl Handle {
    /// Absolute path of this handle. Directories other than the root have no trailing slash.
    #[must_use]
    pub fn complete_name(&self) -> &str {
        match self {
            Self::Data(data) => data.complete_name(),
            Self::Dir(dir) => dir.complete_name(),
        }
    }

    /// Per-entry lock held by callers for the duration of a request.
    #[must_use]
    pub fn lock(&self) -> &PriorityLock {
        match self {
            Self::Data(data) => data.lock(),
            Self::Dir(dir) => dir.lock(),
        }
    }

    /// The dataset behind this handle, if it is one.
    #[must_use]
    pub fn as_data(&self) -> Option<&Arc<DataHandle>> {
        match self {
            Self::Data(data) => Some(data),
            Self::Dir(_) => None,
        }
    }

    /// The directory behind this handle, if it is one.
    #[must_use]
    pub fn as_dir(&self) -> Option<&Arc<DirHandle>> {
        match self {
            Self::Dir(dir) => Some(dir),
            Self::Data(_) => None,
        }
    }

    /// Whether both values point at the same catalog entry.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => Arc::ptr_eq(a, b),
            (Self::Dir(a), Self::Dir(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct DataState {
    description: String,
    tool_info: serde_json::Value,
    create_time: SystemTime,
    available: bool,
}

/// A dataset the server can answer requests against.
///
/// `create_time` is the instant the handle's content last changed; temporary results derived
/// from an older version are invalidated when it moves forward.
#[derive(Debug)]
pub struct DataHandle {
    name: String,
    lock: PriorityLock,
    state: RwLock<DataState>,
}

impl DataHandle {
    /// Creates an available dataset named `name` with the current time as creation time.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock: PriorityLock::new(),
            state: RwLock::new(DataState {
                description: description.into(),
                tool_info: serde_json::Value::Null,
                create_time: SystemTime::now(),
                available: true,
            }),
        }
    }

    /// Sets the opaque tool payload at construction time without touching `create_time`.
    #[must_use]
    pub fn with_tool_info(self, tool_info: serde_json::Value) -> Self {
        self.state.write().tool_info = tool_info;
        self
    }

    /// Overrides the creation time at construction time.
    #[must_use]
    pub fn with_create_time(self, at: SystemTime) -> Self {
        self.state.write().create_time = at;
        self
    }

    /// Absolute catalog path, e.g. `/ocean/sst`.
    #[must_use]
    pub fn complete_name(&self) -> &str {
        &self.name
    }

    /// Lock held by requests reading this dataset.
    #[must_use]
    pub fn lock(&self) -> &PriorityLock {
        &self.lock
    }

    /// Human-readable summary of the dataset.
    #[must_use]
    pub fn description(&self) -> String {
        self.state.read().description.clone()
    }

    /// Opaque payload handed to the extraction tool. `Null` when none was configured.
    #[must_use]
    pub fn tool_info(&self) -> serde_json::Value {
        self.state.read().tool_info.clone()
    }

    /// When the current version of the data came into being.
    #[must_use]
    pub fn create_time(&self) -> SystemTime {
        self.state.read().create_time
    }

    /// Whether the dataset may be served. Cleared when the handle leaves the catalog.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.read().available
    }

    /// Replaces the description and advances `create_time`.
    pub fn set_description(&self, description: impl Into<String>) {
        let mut state = self.state.write();
        state.description = description.into();
        state.create_time = SystemTime::now();
    }

    /// Replaces the tool payload and advances `create_time`.
    pub fn set_tool_info(&self, tool_info: serde_json::Value) {
        let mut state = self.state.write();
        state.tool_info = tool_info;
        state.create_time = SystemTime::now();
    }

    /// Moves `create_time` forward to `at`. Earlier instants are ignored.
    pub fn touch(&self, at: SystemTime) {
        let mut state = self.state.write();
        if at > state.create_time {
            state.create_time = at;
        }
    }

    /// Marks the handle as served or withdrawn. Withdrawn handles resolve as not found.
    pub fn set_available(&self, available: bool) {
        self.state.write().available = available;
    }
}

/// A directory of the catalog tree, children keyed by complete name.
#[derive(Debug)]
pub struct DirHandle {
    name: String,
    lock: PriorityLock,
    children: RwLock<BTreeMap<String, Handle>>,
}

impl DirHandle {
    /// Creates an empty directory named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock: PriorityLock::new(),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    /// Absolute catalog path. The root is `/`.
    #[must_use]
    pub fn complete_name(&self) -> &str {
        &self.name
    }

    /// Lock held by requests listing this directory.
    #[must_use]
    pub fn lock(&self) -> &PriorityLock {
        &self.lock
    }

    /// Whether this is the catalog root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name == "/"
    }

    /// Looks up a direct child by complete name.
    #[must_use]
    pub fn child(&self, complete_name: &str) -> Option<Handle> {
        self.children.read().get(complete_name).cloned()
    }

    /// Snapshot of the direct children in name order.
    #[must_use]
    pub fn children(&self) -> Vec<Handle> {
        self.children.read().values().cloned().collect()
    }

    /// Whether the directory has no children left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }

    /// The prefix every child name starts with.
    #[must_use]
    pub(crate) fn child_prefix(&self) -> String {
        if self.is_root() {
            "/".to_owned()
        } else {
            format!("{}/", self.name)
        }
    }

    pub(crate) fn insert_child(&self, handle: Handle) -> Option<Handle> {
        self.children
            .write()
            .insert(handle.complete_name().to_owned(), handle)
    }

    pub(crate) fn remove_child(&self, complete_name: &str) -> Option<Handle> {
        self.children.write().remove(complete_name)
    }
}

/// A cached derived result: one or more datasets sharing one set of storage files.
///
/// The result is only valid while every dataset named in `dependencies` is unchanged since
/// `create_time`.
#[derive(Debug)]
pub struct TempHandle {
    datasets: Vec<Arc<DataHandle>>,
    create_time: SystemTime,
    storage_size: u64,
    dependencies: BTreeSet<String>,
    storage: Vec<PathBuf>,
}

impl TempHandle {
    /// Wraps `datasets`, created now, with no storage and no dependencies.
    #[must_use]
    pub fn new(datasets: Vec<Arc<DataHandle>>) -> Self {
        Self {
            datasets,
            create_time: SystemTime::now(),
            storage_size: 0,
            dependencies: BTreeSet::new(),
            storage: Vec::new(),
        }
    }

    /// Records the permanent datasets this entry was derived from.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches storage files and sums their current sizes. Missing files count as empty.
    #[must_use]
    pub fn with_storage(mut self, files: Vec<PathBuf>) -> Self {
        self.storage_size = files
            .iter()
            .filter_map(|f| std::fs::metadata(f).ok())
            .map(|m| m.len())
            .sum();
        self.storage = files;
        self
    }

    /// Overrides the accounted size, for producers that know it better than the file system.
    #[must_use]
    pub fn with_storage_size(mut self, bytes: u64) -> Self {
        self.storage_size = bytes;
        self
    }

    /// Backdates or postdates the entry, mostly for restored state.
    #[must_use]
    pub fn with_create_time(mut self, at: SystemTime) -> Self {
        self.create_time = at;
        self
    }

    /// Datasets published under the temp namespace by this entry.
    #[must_use]
    pub fn datasets(&self) -> &[Arc<DataHandle>] {
        &self.datasets
    }

    /// When the entry was produced.
    #[must_use]
    pub fn create_time(&self) -> SystemTime {
        self.create_time
    }

    /// Accounted storage in bytes.
    #[must_use]
    pub fn storage_size(&self) -> u64 {
        self.storage_size
    }

    /// Names of the permanent datasets this entry was derived from.
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Files deleted when the entry is evicted.
    #[must_use]
    pub fn storage(&self) -> &[PathBuf] {
        &self.storage
    }

    /// Whether this entry was derived from `name` before `changed_at`.
    #[must_use]
    pub fn depends_on_older(&self, name: &str, changed_at: SystemTime) -> bool {
        self.create_time < changed_at && self.dependencies.contains(name)
    }

    /// Marks every constituent dataset unavailable and removes the storage files.
    ///
    /// Never fails: files already gone are skipped, other errors are logged. Calling it twice is
    /// harmless.
    pub fn delete_storage(&self) {
        for data in &self.datasets {
            data.set_available(false);
        }
        for file in &self.storage {
            match std::fs::remove_file(file) {
                Ok(()) => debug!(path = ?file, "Removed temp storage."),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?file, error = %e, "Failed to remove temp storage."),
            }
        }
    }
}
