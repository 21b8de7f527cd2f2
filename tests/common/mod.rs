#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use datacat::catalog::{Catalog, CatalogConfig, DataHandle, TempHandle};
use datacat::import::{FreshnessProbe, ImportError, Importer, NeverStale, ProbeError};
use rustc_hash::FxHashSet;

/// In-memory catalog with no freshness checks.
pub fn catalog(config: &CatalogConfig) -> Catalog {
    Catalog::in_memory(config, Arc::new(NeverStale))
}

pub fn data(name: &str) -> Arc<DataHandle> {
    Arc::new(DataHandle::new(name, format!("dataset {name}")))
}

/// `now - secs`.
pub fn ago(secs: u64) -> SystemTime {
    SystemTime::now() - Duration::from_secs(secs)
}

/// A temp entry with one dataset under a freshly allocated name.
pub fn temp(catalog: &Catalog) -> (TempHandle, String) {
    let name = catalog.allocate_temp_name();
    (TempHandle::new(vec![data(&name)]), name)
}

/// Probe whose verdicts are scripted by the test.
#[derive(Default)]
pub struct ScriptedProbe {
    stale: Mutex<FxHashSet<String>>,
    pub reloads: AtomicUsize,
    fail: Mutex<bool>,
}

impl ScriptedProbe {
    pub fn mark_stale(&self, name: &str) {
        self.stale.lock().unwrap().insert(name.to_owned());
    }

    pub fn fail_checks(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl FreshnessProbe for ScriptedProbe {
    fn is_stale(&self, data: &DataHandle) -> Result<bool, ProbeError> {
        if *self.fail.lock().unwrap() {
            return Err(ProbeError::Io {
                name: data.complete_name().to_owned(),
                path: "/nonexistent".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(self.stale.lock().unwrap().contains(data.complete_name()))
    }

    fn reload(&self, data: &DataHandle) -> Result<(), ProbeError> {
        self.stale.lock().unwrap().remove(data.complete_name());
        self.reloads.fetch_add(1, Ordering::SeqCst);
        data.touch(SystemTime::now() + Duration::from_millis(1));
        Ok(())
    }
}

/// Importer that hands back a fixed list.
pub struct StaticImporter(pub Vec<Arc<DataHandle>>);

impl Importer for StaticImporter {
    fn import(&self, _loaded: &[Arc<DataHandle>]) -> Result<Vec<Arc<DataHandle>>, ImportError> {
        Ok(self.0.clone())
    }
}
