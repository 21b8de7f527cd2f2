//! Module-scoped blob store.
//!
//! Every component that persists something owns a subdirectory named by an owner key. Entries
//! are plain files below it.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, trace};

/// Errors raised by [`BlobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The configured root exists but is a file.
    #[error("Store root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Owner or entry keys must be single, non-empty path components.
    #[error("Invalid store key '{0}'")]
    InvalidKey(String),

    /// A file system operation failed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Keys may not escape the owner directory.
fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        return Err(StoreError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// File-backed store rooted at one directory.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    unique: AtomicU64,
}

impl BlobStore {
    /// Opens the store at `root`, creating the directory if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        match std::fs::metadata(&root) {
            Ok(meta) if !meta.is_dir() => return Err(StoreError::NotADirectory(root)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
                debug!(root = ?root, "Created blob store root.");
            }
            Err(e) => return Err(StoreError::io(&root, e)),
        }
        Ok(Self {
            root,
            unique: AtomicU64::new(0),
        })
    }

    /// Directory holding all owners.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &str) -> Result<PathBuf, StoreError> {
        check_key(owner)?;
        let dir = self.root.join(owner);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(dir)
    }

    /// Path of `entry` under `owner`. The owner directory is created; the entry is not.
    pub fn entry_path(&self, owner: &str, entry: &str) -> Result<PathBuf, StoreError> {
        check_key(entry)?;
        Ok(self.owner_dir(owner)?.join(entry))
    }

    /// Like [`entry_path`](Self::entry_path), but an existing entry last modified before
    /// `stale_before` is deleted first so the caller regenerates it.
    pub fn entry_path_fresh(
        &self,
        owner: &str,
        entry: &str,
        stale_before: SystemTime,
    ) -> Result<PathBuf, StoreError> {
        let path = self.entry_path(owner, entry)?;
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(path),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if modified < stale_before {
            debug!(path = ?path, "Discarding stale store entry.");
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(path)
    }

    /// Reads an entry. A missing entry is `Ok(None)`.
    pub fn read(&self, owner: &str, entry: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.entry_path(owner, entry)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Replaces an entry atomically: the bytes go to a sibling file that is then renamed over
    /// the entry, so readers see either the old or the new content.
    pub fn write(&self, owner: &str, entry: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(owner, entry)?;
        let staging = self.unique_path(owner, &format!(".{entry}"), ".partial")?;

        let result = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&staging)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .and_then(|()| std::fs::rename(&staging, &path));

        if let Err(e) = result {
            let _ = std::fs::remove_file(&staging);
            return Err(StoreError::io(&path, e));
        }
        trace!(path = ?path, len = bytes.len(), "Wrote store entry.");
        Ok(())
    }

    /// Allocates a new, empty, uniquely named file `prefix<n>suffix` under `owner`.
    ///
    /// Names are unique across threads of this process and across processes sharing the
    /// store, since the file is created with `create_new`.
    pub fn unique_path(
        &self,
        owner: &str,
        prefix: &str,
        suffix: &str,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.owner_dir(owner)?;
        let pid = std::process::id();
        loop {
            let n = self.unique.fetch_add(1, Ordering::Relaxed);
            let name = format!("{prefix}{pid}-{n}{suffix}");
            check_key(&name)?;
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }
}
