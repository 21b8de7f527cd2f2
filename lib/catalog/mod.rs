//! The dataset namespace.
//!
//! A [`Catalog`] owns a tree of [`DirHandle`]s whose leaves are permanent [`DataHandle`]s, and a
//! flat table of temporary entries whose names start with `/_`. Temporary entries are cached
//! derived results; they are kept in a FIFO that is trimmed against count, storage and age
//! limits, and dropped early when a dataset they were derived from changes.
//!
//! Locking follows two levels. Each handle carries its own [`PriorityLock`], taken shared for the
//! duration of a request by [`Catalog::get_locked`]. The catalog's own lock is only taken
//! exclusively for structural mutation and shared for whole-tree snapshots; path resolution never
//! touches it and reads directory maps under short internal locks instead.

mod handle;
mod persist;

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytesize::ByteSize;
use hashlink::LinkedHashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use handle::{DataHandle, DirHandle, Handle, TempHandle};
pub use persist::{DATASETS_ENTRY, OWNER as STORE_OWNER, TEMPS_ENTRY};

use crate::import::{FreshnessProbe, ImportError, Importer};
use crate::lock::PriorityLock;
use crate::store::BlobStore;
use persist::{DatasetRecord, TempRecord};

/// Prefix of the flat temporary namespace.
pub const TEMP_PREFIX: &str = "/_";

/// Limits and timeouts of a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CatalogConfig {
    /// Maximum number of temp entries. `0` means unlimited.
    pub max_temp_entries: usize,

    /// Maximum total size of temp storage. `0` means unlimited.
    pub max_temp_storage: ByteSize,

    /// Temp entries at least this old are evicted. `0` means unlimited.
    pub temp_age_limit_hours: u64,

    /// How long reconfiguration waits for the catalog's exclusive lock.
    pub admin_lock_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_temp_entries: 0,
            max_temp_storage: ByteSize::b(0),
            temp_age_limit_hours: 0,
            admin_lock_timeout_secs: 30,
        }
    }
}

impl CatalogConfig {
    /// Age at which a temp entry expires. Zero disables the age limit.
    #[must_use]
    pub fn temp_age_limit(&self) -> Duration {
        Duration::from_secs(self.temp_age_limit_hours.saturating_mul(3600))
    }

    /// How long administrative operations wait for the catalog lock.
    #[must_use]
    pub fn admin_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_lock_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy)]
struct TempLimits {
    max_entries: usize,
    max_storage: u64,
    max_age: Duration,
}

/// Errors of administrative catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog stayed busy for longer than the configured timeout.
    #[error("Timed out after {0:?} waiting for exclusive access to the catalog")]
    LockTimeout(Duration),

    /// The importer could not produce a dataset list.
    #[error("Import failed: {0}")]
    Import(#[from] ImportError),
}

/// Why a handle could not be placed in the catalog.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// Another entry already occupies the path or one of its ancestors.
    #[error("'{name}' conflicts with existing entry '{occupied_by}'")]
    PathConflict {
        /// Name that could not be placed.
        name: String,
        /// Entry already holding the path or an ancestor of it.
        occupied_by: String,
    },

    /// Permanent dataset names must be absolute and outside the temp namespace.
    #[error("'{0}' is not a valid dataset name")]
    InvalidName(String),

    /// Temp entries may only publish names under the temp namespace.
    #[error("Temp entry name '{0}' does not start with '/_'")]
    NotTempName(String),
}

/// Outcome of [`Catalog::reconfigure`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Names of datasets withdrawn from the catalog.
    pub removed: Vec<String>,
    /// Names of datasets newly placed in the catalog.
    pub added: Vec<String>,
    /// Names that could not be placed. The reasons are logged.
    pub skipped: Vec<String>,
}

/// A resolved handle whose shared lock the calling thread holds until this value is dropped.
#[must_use = "the handle's shared lock is released as soon as this is dropped"]
pub struct LockedHandle {
    handle: Handle,
    owned: bool,
    _not_send: PhantomData<*const ()>,
}

impl LockedHandle {
    /// The resolved handle.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Deref for LockedHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for LockedHandle {
    fn drop(&mut self) {
        if self.owned {
            self.handle.lock().release_shared();
        }
    }
}

impl std::fmt::Debug for LockedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LockedHandle")
            .field(&self.handle.complete_name())
            .finish()
    }
}

#[derive(Debug, Default)]
struct TempQueue {
    /// Insertion order is age order.
    fifo: LinkedHashMap<u64, Arc<TempHandle>>,
    storage: u64,
}

/// `path` without trailing slashes; the empty path is the root.
#[must_use]
pub fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

fn valid_dataset_name(name: &str) -> bool {
    name.len() > 1
        && name.starts_with('/')
        && !name.ends_with('/')
        && !name.contains("//")
        && !is_temp_name(name)
}

/// Complete name of the component of `path` directly below `dir`, or `None` if `path` does not
/// lie strictly below it.
fn next_component<'a>(path: &'a str, dir: &DirHandle) -> Option<&'a str> {
    let prefix = dir.child_prefix();
    let rest = path.strip_prefix(prefix.as_str())?;
    if rest.is_empty() {
        return None;
    }
    let end = rest.find('/').map_or(path.len(), |i| prefix.len() + i);
    Some(&path[..end])
}

fn parent_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &name[..i],
    }
}

/// Hierarchical namespace of datasets plus the temp result cache.
pub struct Catalog {
    lock: PriorityLock,
    root: Arc<DirHandle>,
    temp_entries: scc::HashMap<String, Arc<DataHandle>>,
    queue: Mutex<TempQueue>,
    next_temp_id: AtomicU64,
    limits: TempLimits,
    admin_lock_timeout: Duration,
    store: Option<Arc<BlobStore>>,
    probe: Arc<dyn FreshnessProbe>,
}

impl Catalog {
    /// Opens a catalog persisted in `store`, restoring the temp FIFO and then the dataset tree.
    ///
    /// Missing or corrupt state yields an empty catalog; the problem is logged.
    #[must_use]
    pub fn open(
        config: &CatalogConfig,
        store: Arc<BlobStore>,
        probe: Arc<dyn FreshnessProbe>,
    ) -> Self {
        let catalog = Self::build(config, Some(store), probe);
        catalog.restore();
        catalog
    }

    /// A catalog that keeps no state on disk.
    #[must_use]
    pub fn in_memory(config: &CatalogConfig, probe: Arc<dyn FreshnessProbe>) -> Self {
        Self::build(config, None, probe)
    }

    fn build(
        config: &CatalogConfig,
        store: Option<Arc<BlobStore>>,
        probe: Arc<dyn FreshnessProbe>,
    ) -> Self {
        Self {
            lock: PriorityLock::new(),
            root: Arc::new(DirHandle::new("/")),
            temp_entries: scc::HashMap::new(),
            queue: Mutex::new(TempQueue::default()),
            next_temp_id: AtomicU64::new(0),
            limits: TempLimits {
                max_entries: config.max_temp_entries,
                max_storage: config.max_temp_storage.as_u64(),
                max_age: config.temp_age_limit(),
            },
            admin_lock_timeout: config.admin_lock_timeout(),
            store,
            probe,
        }
    }

    fn restore(&self) {
        let Some(store) = &self.store else { return };
        let _guard = self.lock.write();

        let temps: Vec<TempRecord> = persist::load(store, TEMPS_ENTRY);
        let mut queue = self.queue.lock();
        for temp in temps.into_iter().filter_map(TempRecord::restore) {
            self.enqueue(&mut queue, Arc::new(temp));
        }

        let datasets: Vec<DatasetRecord> = persist::load(store, DATASETS_ENTRY);
        let mut restored = 0usize;
        for record in datasets {
            let data = Arc::new(record.restore());
            match self.place(Arc::clone(&data)) {
                Ok(()) => restored += 1,
                Err(e) => warn!(error = %e, "Skipping persisted dataset."),
            }
        }

        self.check_limits(&mut queue);
        self.persist_temps(&queue);
        info!(
            datasets = restored,
            temp_entries = queue.fifo.len(),
            "Restored catalog state."
        );
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Arc<DirHandle> {
        &self.root
    }

    /// The catalog's own lock. Held exclusively during structural mutation.
    #[must_use]
    pub fn lock(&self) -> &PriorityLock {
        &self.lock
    }

    /// Resolves `path` to a handle without locking it or probing it.
    fn lookup(&self, path: &str) -> Option<Handle> {
        let path = normalize_path(path);
        if path == "/" {
            return Some(Handle::Dir(Arc::clone(&self.root)));
        }
        if is_temp_name(path) {
            return self
                .temp_entries
                .read_sync(path, |_, data| Handle::Data(Arc::clone(data)));
        }
        let dir = self.deepest_dir(path);
        if dir.complete_name() == path {
            return Some(Handle::Dir(dir));
        }
        dir.child(path)
    }

    /// Deepest existing directory on the way to `path`.
    fn deepest_dir(&self, path: &str) -> Arc<DirHandle> {
        let mut dir = Arc::clone(&self.root);
        while let Some(component) = next_component(path, &dir) {
            match dir.child(component) {
                Some(Handle::Dir(sub)) => dir = sub,
                _ => break,
            }
        }
        dir
    }

    /// Resolves `path` and returns its handle with the handle's shared lock held.
    ///
    /// Paths starting with `/_` are looked up in the temp table, everything else in the tree.
    /// Trailing slashes are ignored and the empty path is the root. A permanent dataset is
    /// checked for freshness first and reloaded if its source changed.
    pub fn get_locked(&self, path: &str) -> Option<LockedHandle> {
        let handle = self.lookup(path)?;
        if let Handle::Data(data) = &handle
            && !is_temp_name(data.complete_name())
        {
            self.refresh(data);
        }
        let owned = handle.lock().lock_shared();
        Some(LockedHandle {
            handle,
            owned,
            _not_send: PhantomData,
        })
    }

    fn refresh(&self, data: &Arc<DataHandle>) {
        match self.probe.is_stale(data) {
            Ok(false) => {}
            Ok(true) if data.lock().is_shared_held_by_caller() => {
                // Taking the exclusive lock would give up the caller's outer hold.
                debug!(
                    name = data.complete_name(),
                    "Dataset is stale but already held by this thread, reloading on a later lookup."
                );
            }
            Ok(true) => {
                let reloaded = {
                    let _guard = data.lock().write();
                    self.probe.reload(data)
                };
                match reloaded {
                    Ok(()) => self.dataset_changed(data),
                    Err(e) => warn!(
                        name = data.complete_name(),
                        error = %e,
                        "Failed to reload dataset, serving last known state."
                    ),
                }
            }
            Err(e) => warn!(
                name = data.complete_name(),
                error = %e,
                "Freshness check failed, serving last known state."
            ),
        }
    }

    /// Whether `path` resolves to anything. Takes no lock and does not probe.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Directory containing `handle`. The root is its own parent.
    #[must_use]
    pub fn parent_of(&self, handle: &Handle) -> Arc<DirHandle> {
        let name = handle.complete_name();
        if is_temp_name(name) {
            return Arc::clone(&self.root);
        }
        let parent = parent_name(name);
        let dir = self.deepest_dir(parent);
        if dir.complete_name() != parent {
            debug!(name, "Parent of handle is no longer in the catalog.");
        }
        dir
    }

    /// A fresh name in the temp namespace.
    #[must_use]
    pub fn allocate_temp_name(&self) -> String {
        loop {
            let n = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
            let name = format!("{TEMP_PREFIX}tmp{n}");
            if !self.temp_entries.contains_sync(&name) {
                return name;
            }
        }
    }

    /// Caches a derived result.
    ///
    /// The entry is appended to the FIFO and its datasets become reachable under their `/_`
    /// names. If a dataset it depends on already changed after the entry was created, it is
    /// evicted again right away. Limits are enforced afterwards.
    pub fn add_temp(&self, temp: TempHandle) -> Result<(), PlacementError> {
        if let Some(bad) = temp
            .datasets()
            .iter()
            .find(|d| !is_temp_name(d.complete_name()))
        {
            return Err(PlacementError::NotTempName(bad.complete_name().to_owned()));
        }

        let _guard = self.lock.write();
        let temp = Arc::new(temp);
        let mut queue = self.queue.lock();
        let id = self.enqueue(&mut queue, Arc::clone(&temp));

        if let Some(dep) = self.outdated_dependency(&temp) {
            debug!(dependency = dep, "Temp entry outdated on arrival.");
            self.evict(&mut queue, id, "dependency changed");
        }
        self.check_limits(&mut queue);
        self.persist_temps(&queue);
        Ok(())
    }

    fn enqueue(&self, queue: &mut TempQueue, temp: Arc<TempHandle>) -> u64 {
        let id = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
        for data in temp.datasets() {
            self.temp_entries
                .upsert_sync(data.complete_name().to_owned(), Arc::clone(data));
        }
        queue.storage = queue.storage.saturating_add(temp.storage_size());
        queue.fifo.insert(id, temp);
        id
    }

    /// First dependency of `temp` that changed after `temp` was created.
    fn outdated_dependency<'t>(&self, temp: &'t TempHandle) -> Option<&'t str> {
        temp.dependencies()
            .iter()
            .find(|dep| {
                matches!(
                    self.lookup(dep),
                    Some(Handle::Data(data)) if data.create_time() > temp.create_time()
                )
            })
            .map(String::as_str)
    }

    fn check_limits(&self, queue: &mut TempQueue) {
        let limits = self.limits;
        if limits.max_entries > 0 {
            while queue.fifo.len() > limits.max_entries {
                if !self.evict_oldest(queue, "entry limit") {
                    break;
                }
            }
        }
        if limits.max_storage > 0 {
            while queue.storage > limits.max_storage {
                if !self.evict_oldest(queue, "storage limit") {
                    break;
                }
            }
        }
        if !limits.max_age.is_zero() {
            let now = SystemTime::now();
            while let Some((_, oldest)) = queue.fifo.front() {
                let age = now
                    .duration_since(oldest.create_time())
                    .unwrap_or_default();
                if age < limits.max_age {
                    break;
                }
                self.evict_oldest(queue, "age limit");
            }
        }
    }

    fn evict_oldest(&self, queue: &mut TempQueue, reason: &str) -> bool {
        let Some(id) = queue.fifo.front().map(|(id, _)| *id) else {
            return false;
        };
        self.evict(queue, id, reason);
        true
    }

    fn evict(&self, queue: &mut TempQueue, id: u64, reason: &str) {
        let Some(temp) = queue.fifo.remove(&id) else {
            return;
        };
        queue.storage = queue.storage.saturating_sub(temp.storage_size());
        for data in temp.datasets() {
            let _guard = data.lock().write();
            if let scc::hash_map::Entry::Occupied(occupied) = self
                .temp_entries
                .entry_sync(data.complete_name().to_owned())
                && Arc::ptr_eq(occupied.get(), data)
            {
                let _ = occupied.remove_entry();
            }
        }
        temp.delete_storage();
        info!(
            reason,
            datasets = temp.datasets().len(),
            bytes = temp.storage_size(),
            "Evicted temp entry."
        );
    }

    /// Evicts every temp entry.
    pub fn clear_temp(&self) {
        let _guard = self.lock.write();
        let mut queue = self.queue.lock();
        while self.evict_oldest(&mut queue, "cleared") {}
        self.persist_temps(&queue);
    }

    /// Drops every temp entry derived from `data` before its current `create_time`.
    ///
    /// Called internally when a reload or reconfiguration changes a dataset; callers that mutate
    /// a dataset directly call it themselves.
    pub fn dataset_changed(&self, data: &DataHandle) {
        let _guard = self.lock.write();
        let name = data.complete_name();
        let changed_at = data.create_time();
        let mut queue = self.queue.lock();
        let stale: Vec<u64> = queue
            .fifo
            .iter()
            .filter(|(_, temp)| temp.depends_on_older(name, changed_at))
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return;
        }
        for id in stale {
            self.evict(&mut queue, id, "dependency changed");
        }
        self.persist_temps(&queue);
    }

    /// Places `data` in the tree, creating missing directories.
    fn place(&self, data: Arc<DataHandle>) -> Result<(), PlacementError> {
        let name = data.complete_name().to_owned();
        if !valid_dataset_name(&name) {
            return Err(PlacementError::InvalidName(name));
        }
        let conflict = |occupied_by: &str| PlacementError::PathConflict {
            name: name.clone(),
            occupied_by: occupied_by.to_owned(),
        };

        let mut dir = Arc::clone(&self.root);
        loop {
            let Some(component) = next_component(&name, &dir) else {
                return Err(conflict(dir.complete_name()));
            };
            if component == name {
                if let Some(existing) = dir.child(&name) {
                    let err = conflict(existing.complete_name());
                    self.prune(dir);
                    return Err(err);
                }
                dir.insert_child(Handle::Data(data));
                return Ok(());
            }
            match dir.child(component) {
                Some(Handle::Dir(sub)) => dir = sub,
                Some(Handle::Data(_)) => {
                    let err = conflict(component);
                    self.prune(dir);
                    return Err(err);
                }
                None => {
                    let sub = Arc::new(DirHandle::new(component));
                    dir.insert_child(Handle::Dir(Arc::clone(&sub)));
                    dir = sub;
                }
            }
        }
    }

    /// Removes `data` from the tree if that exact handle is there.
    fn remove(&self, data: &Arc<DataHandle>) -> bool {
        let name = data.complete_name();
        let dir = self.deepest_dir(name);
        match dir.child(name) {
            Some(Handle::Data(current)) if Arc::ptr_eq(&current, data) => {}
            _ => return false,
        }
        {
            let _guard = data.lock().write();
            data.set_available(false);
            dir.remove_child(name);
        }
        self.prune(dir);
        true
    }

    /// Removes `dir` and then each ancestor that is left without children. The root stays.
    fn prune(&self, mut dir: Arc<DirHandle>) {
        while !dir.is_root() && dir.is_empty() {
            let parent = self.deepest_dir(parent_name(dir.complete_name()));
            parent.remove_child(dir.complete_name());
            debug!(name = dir.complete_name(), "Removed empty directory.");
            dir = parent;
        }
    }

    fn collect_datasets(&self) -> Vec<Arc<DataHandle>> {
        let mut out = Vec::new();
        let mut pending = vec![Arc::clone(&self.root)];
        while let Some(dir) = pending.pop() {
            for child in dir.children() {
                match child {
                    Handle::Data(data) => out.push(data),
                    Handle::Dir(sub) => pending.push(sub),
                }
            }
        }
        out.sort_by(|a, b| a.complete_name().cmp(b.complete_name()));
        out
    }

    /// All permanent datasets, sorted by name.
    #[must_use]
    pub fn datasets(&self) -> Vec<Arc<DataHandle>> {
        let _guard = self.lock.read();
        self.collect_datasets()
    }

    /// Replaces the dataset tree with `datasets`.
    ///
    /// Handles already in the catalog are kept when the same `Arc` is in `datasets`; all others
    /// are removed. Listed handles whose name is free are added. Waits at most the configured
    /// admin timeout for the catalog's exclusive lock.
    pub fn reconfigure(
        &self,
        datasets: Vec<Arc<DataHandle>>,
    ) -> Result<ReconcileReport, CatalogError> {
        let Some(_guard) = self.lock.try_write_for(self.admin_lock_timeout) else {
            warn!(
                timeout = ?self.admin_lock_timeout,
                "Reconfiguration could not lock the catalog."
            );
            return Err(CatalogError::LockTimeout(self.admin_lock_timeout));
        };

        let wanted: FxHashSet<*const DataHandle> = datasets.iter().map(Arc::as_ptr).collect();
        let mut report = ReconcileReport::default();

        for current in self.collect_datasets() {
            if !wanted.contains(&Arc::as_ptr(&current)) && self.remove(&current) {
                report.removed.push(current.complete_name().to_owned());
            }
        }

        for data in datasets {
            if self.lookup(data.complete_name()).is_some_and(|h| {
                h.as_data().is_some_and(|current| Arc::ptr_eq(current, &data))
            }) {
                continue;
            }
            match self.place(Arc::clone(&data)) {
                Ok(()) => {
                    report.added.push(data.complete_name().to_owned());
                    self.dataset_changed(&data);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping dataset during reconfiguration.");
                    report.skipped.push(data.complete_name().to_owned());
                }
            }
        }

        self.persist_datasets();
        info!(
            removed = report.removed.len(),
            added = report.added.len(),
            skipped = report.skipped.len(),
            "Reconfigured catalog."
        );
        Ok(report)
    }

    /// Asks `importer` for the dataset list and reconfigures to it.
    pub fn reimport(&self, importer: &dyn Importer) -> Result<ReconcileReport, CatalogError> {
        let loaded = self.datasets();
        let datasets = importer.import(&loaded)?;
        self.reconfigure(datasets)
    }

    /// Number of entries in the temp cache.
    #[must_use]
    pub fn temp_entry_count(&self) -> usize {
        self.queue.lock().fifo.len()
    }

    /// Total accounted temp storage.
    #[must_use]
    pub fn temp_storage(&self) -> ByteSize {
        ByteSize::b(self.queue.lock().storage)
    }

    fn persist_temps(&self, queue: &TempQueue) {
        let Some(store) = &self.store else { return };
        let records: Vec<TempRecord> = queue
            .fifo
            .values()
            .map(|t| TempRecord::capture(t))
            .collect();
        persist::save(store, TEMPS_ENTRY, &records);
    }

    fn persist_datasets(&self) {
        let Some(store) = &self.store else { return };
        let records: Vec<DatasetRecord> = self
            .collect_datasets()
            .iter()
            .map(|d| DatasetRecord::capture(d))
            .collect();
        persist::save(store, DATASETS_ENTRY, &records);
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("lock", &self.lock)
            .field("temp_entries", &self.temp_entry_count())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
