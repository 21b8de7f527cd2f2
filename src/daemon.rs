use std::path::PathBuf;
use std::sync::Arc;

use datacat::catalog::{Catalog, CatalogError, ReconcileReport};
use datacat::import::MtimeProbe;
use datacat::privilege::{ConfigurationError, PrivilegeResolver};
use datacat::server::Server;
use datacat::store::{BlobStore, StoreError};
use thiserror::Error;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::app_config::{self, Config};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to open the store: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid privileges: {0}")]
    Privileges(#[from] ConfigurationError),

    #[error("Failed to load datasets: {0}")]
    Catalog(#[from] CatalogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a running server holds on to.
pub struct Services {
    pub server: Arc<Server>,
    /// Shared by every importer built over the process lifetime, since the catalog keeps the
    /// probe it was opened with.
    probe: MtimeProbe,
}

impl Services {
    /// Opens the persisted catalog and loads the configured datasets into it.
    pub fn open(config: &Config) -> Result<Self, DaemonError> {
        let store = Arc::new(BlobStore::open(&config.store.path)?);
        let probe = MtimeProbe::new();
        let catalog = Catalog::open(&config.catalog, store, Arc::new(probe.clone()));
        Self::start(config, catalog, probe)
    }

    /// Like [`open`](Self::open), without reading or writing any state on disk.
    pub fn ephemeral(config: &Config) -> Result<Self, DaemonError> {
        let probe = MtimeProbe::new();
        let catalog = Catalog::in_memory(&config.catalog, Arc::new(probe.clone()));
        Self::start(config, catalog, probe)
    }

    fn start(config: &Config, catalog: Catalog, probe: MtimeProbe) -> Result<Self, DaemonError> {
        let privileges = PrivilegeResolver::from_config(&config.privileges)?;
        let server = Arc::new(Server::new(Arc::new(catalog), privileges));
        let services = Self { server, probe };
        let report = services.reimport(config)?;
        info!(
            datasets = report.added.len(),
            removed = report.removed.len(),
            "Loaded datasets."
        );
        Ok(services)
    }

    fn reimport(&self, config: &Config) -> Result<ReconcileReport, CatalogError> {
        let importer = config.datasets.importer().with_probe(self.probe.clone());
        self.server.reimport(&importer)
    }

    /// Applies a freshly loaded configuration. Each part that fails is logged and keeps its
    /// previous state.
    pub fn reload(&self, config: &Config) {
        if let Err(e) = self.server.reload_privileges(&config.privileges) {
            error!(error = %e, "Keeping previous privileges.");
        }
        match self.reimport(config) {
            Ok(report) => info!(
                added = report.added.len(),
                removed = report.removed.len(),
                skipped = report.skipped.len(),
                "Reloaded datasets."
            ),
            Err(e) => error!(error = %e, "Keeping previous datasets."),
        }
    }
}

fn reload_from(config_path: Option<&std::path::Path>, services: &Services) {
    match Config::load_or_default(config_path) {
        Ok(config) => services.reload(&config),
        Err(e) => error!(error = %e, "Failed to reload configuration, keeping current state."),
    }
}

enum Signal {
    Shutdown,
    Reload,
}

async fn wait_for_signal(
    sigterm: &mut tokio::signal::unix::Signal,
    sighup: &mut tokio::signal::unix::Signal,
) -> Signal {
    select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
            Signal::Shutdown
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
            Signal::Shutdown
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, reloading...");
            Signal::Reload
        },
    }
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    config_path: Option<PathBuf>,
) -> Result<(), DaemonError> {
    use tokio::signal::unix::{SignalKind, signal};

    let services = tokio::task::spawn_blocking(move || Services::open(&config))
        .await
        .map_err(std::io::Error::other)??;
    let services = Arc::new(services);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    info!("datacat is running. Send SIGHUP to reload, Ctrl+C to stop.");
    loop {
        match wait_for_signal(&mut sigterm, &mut sighup).await {
            Signal::Shutdown => break,
            Signal::Reload => {
                let services = Arc::clone(&services);
                let config_path = config_path.clone();
                let reloaded = tokio::task::spawn_blocking(move || {
                    reload_from(config_path.as_deref(), &services);
                })
                .await;
                if let Err(e) = reloaded {
                    warn!(error = %e, "Reload task failed.");
                }
            }
        }
    }

    info!(
        temp_entries = services.server.catalog().temp_entry_count(),
        "Shutting down."
    );
    Ok(())
}

pub fn spawn(config: app_config::Config, config_path: Option<PathBuf>) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, config_path))
}
