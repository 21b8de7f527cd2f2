#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::{ago, data, temp};
use datacat::catalog::{
    Catalog, CatalogConfig, DATASETS_ENTRY, DataHandle, STORE_OWNER, TEMPS_ENTRY,
};
use datacat::import::NeverStale;
use datacat::store::BlobStore;

fn open(store: &Arc<BlobStore>, config: &CatalogConfig) -> Catalog {
    Catalog::open(config, Arc::clone(store), Arc::new(NeverStale))
}

#[test]
fn catalog_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path().join("store")).unwrap());
    let created = ago(7200);

    let temp_name = {
        let catalog = open(&store, &CatalogConfig::default());
        let source = Arc::new(
            DataHandle::new("/ocean/sst", "Sea surface temperature")
                .with_tool_info(serde_json::json!({ "format": "netcdf" }))
                .with_create_time(created),
        );
        catalog.reconfigure(vec![source, data("/ocean/salt")]).unwrap();

        let blob = store.unique_path("temp", "result-", ".bin").unwrap();
        std::fs::write(&blob, b"subset").unwrap();
        let (t, name) = temp(&catalog);
        catalog
            .add_temp(t.with_storage(vec![blob]).with_dependencies(["/ocean/sst"]))
            .unwrap();
        name
    };

    let catalog = open(&store, &CatalogConfig::default());
    let datasets = catalog.datasets();
    assert_eq!(datasets.len(), 2);
    let sst = catalog.get_locked("/ocean/sst").unwrap();
    let sst = sst.as_data().unwrap();
    assert_eq!(sst.description(), "Sea surface temperature");
    assert_eq!(sst.tool_info()["format"], "netcdf");
    assert_eq!(sst.create_time(), created);

    assert_eq!(catalog.temp_entry_count(), 1);
    assert!(catalog.contains(&temp_name));
    assert_eq!(catalog.temp_storage().as_u64(), 6);
    assert_ne!(
        catalog.allocate_temp_name(),
        temp_name,
        "restored names are never handed out again"
    );
}

#[test]
fn temp_entry_with_vanished_storage_is_not_restored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());

    let blob = store.unique_path("temp", "result-", ".bin").unwrap();
    {
        let catalog = open(&store, &CatalogConfig::default());
        let (t, _) = temp(&catalog);
        catalog.add_temp(t.with_storage(vec![blob.clone()])).unwrap();
    }
    std::fs::remove_file(&blob).unwrap();

    let catalog = open(&store, &CatalogConfig::default());
    assert_eq!(catalog.temp_entry_count(), 0);
}

#[test]
fn limits_apply_to_restored_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());
    {
        let catalog = open(&store, &CatalogConfig::default());
        for _ in 0..4 {
            let (t, _) = temp(&catalog);
            catalog.add_temp(t).unwrap();
        }
    }

    let config = CatalogConfig {
        max_temp_entries: 1,
        ..CatalogConfig::default()
    };
    let catalog = open(&store, &config);
    assert_eq!(catalog.temp_entry_count(), 1);
}

#[test]
fn corrupt_state_yields_empty_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());
    store
        .write(STORE_OWNER, DATASETS_ENTRY, b"{ not json")
        .unwrap();
    store.write(STORE_OWNER, TEMPS_ENTRY, b"[1, 2, 3]").unwrap();

    let catalog = open(&store, &CatalogConfig::default());
    assert!(catalog.datasets().is_empty());
    assert_eq!(catalog.temp_entry_count(), 0);

    catalog.reconfigure(vec![data("/a")]).unwrap();
    drop(catalog);
    let catalog = open(&store, &CatalogConfig::default());
    assert_eq!(catalog.datasets().len(), 1, "state is rewritten after recovery");
}

#[test]
fn missing_state_yields_empty_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());
    let catalog = open(&store, &CatalogConfig::default());
    assert!(catalog.datasets().is_empty());
    assert!(catalog.root().is_empty());
}
