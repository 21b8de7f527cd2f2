//! Dispatcher-facing entry point tying access control to the catalog.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogError, Handle, LockedHandle, ReconcileReport, normalize_path};
use crate::import::Importer;
use crate::privilege::{ConfigurationError, PrivilegeConfig, PrivilegeResolver, PrivilegeSet};

/// Errors surfaced to clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The path does not exist, is not available, or may not be seen by this client. The three
    /// cases are deliberately indistinguishable.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// One visible child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    /// Complete name of the child.
    pub name: String,
    /// Whether the child can be listed further.
    pub is_dir: bool,
}

/// Catalog plus the live privilege configuration.
#[derive(Debug)]
pub struct Server {
    catalog: Arc<Catalog>,
    privileges: RwLock<Arc<PrivilegeResolver>>,
}

impl Server {
    /// Serves `catalog` to clients whose rights come from `privileges`.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, privileges: PrivilegeResolver) -> Self {
        Self {
            catalog,
            privileges: RwLock::new(Arc::new(privileges)),
        }
    }

    /// The catalog being served.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The privilege set governing requests from `address`.
    #[must_use]
    pub fn privilege_for(&self, address: &str) -> PrivilegeSet {
        self.privileges.read().resolve(address)
    }

    /// Resolves `path` for a client and returns it with its shared lock held.
    pub fn open(&self, privileges: &PrivilegeSet, path: &str) -> Result<LockedHandle, AccessError> {
        let path = normalize_path(path);
        let not_found = || AccessError::NotFound(path.to_owned());
        if !privileges.allows(path) {
            debug!(set = privileges.name(), path, "Access denied.");
            return Err(not_found());
        }
        let locked = self.catalog.get_locked(path).ok_or_else(not_found)?;
        if let Handle::Data(data) = locked.handle()
            && !data.is_available()
        {
            return Err(not_found());
        }
        Ok(locked)
    }

    /// The children of directory `path` the client could reach.
    ///
    /// A subdirectory is listed if anything below it is allowed, so clients can navigate to
    /// datasets permitted deep inside an otherwise denied tree.
    pub fn list_dir(
        &self,
        privileges: &PrivilegeSet,
        path: &str,
    ) -> Result<Vec<Listing>, AccessError> {
        let path = normalize_path(path);
        let not_found = || AccessError::NotFound(path.to_owned());
        if !privileges.ever_allows(path) {
            return Err(not_found());
        }
        let locked = self.catalog.get_locked(path).ok_or_else(not_found)?;
        let Handle::Dir(dir) = locked.handle() else {
            return Err(not_found());
        };
        Ok(dir
            .children()
            .into_iter()
            .filter_map(|child| match child {
                Handle::Dir(sub) if privileges.ever_allows(sub.complete_name()) => Some(Listing {
                    name: sub.complete_name().to_owned(),
                    is_dir: true,
                }),
                Handle::Data(data)
                    if data.is_available() && privileges.allows(data.complete_name()) =>
                {
                    Some(Listing {
                        name: data.complete_name().to_owned(),
                        is_dir: false,
                    })
                }
                _ => None,
            })
            .collect())
    }

    /// Swaps in a new privilege configuration. A rejected configuration leaves the current one
    /// in place.
    pub fn reload_privileges(&self, config: &PrivilegeConfig) -> Result<(), ConfigurationError> {
        let resolver = PrivilegeResolver::from_config(config)?;
        *self.privileges.write() = Arc::new(resolver);
        info!("Reloaded privilege configuration.");
        Ok(())
    }

    /// Re-runs `importer` and reconciles the catalog with its result.
    pub fn reimport(&self, importer: &dyn Importer) -> Result<ReconcileReport, CatalogError> {
        self.catalog.reimport(importer)
    }
}
