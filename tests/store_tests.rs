#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use datacat::store::BlobStore;

#[test]
fn write_then_read_replaces_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();

    assert_eq!(store.read("catalog", "state.json").unwrap(), None);
    store.write("catalog", "state.json", b"one").unwrap();
    store.write("catalog", "state.json", b"two").unwrap();
    assert_eq!(
        store.read("catalog", "state.json").unwrap().as_deref(),
        Some(&b"two"[..])
    );

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("catalog"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "staging files are renamed away: {leftovers:?}");
}

#[test]
fn owners_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();
    store.write("a", "entry", b"from a").unwrap();
    assert_eq!(store.read("b", "entry").unwrap(), None);
    assert_eq!(
        store.entry_path("a", "entry").unwrap(),
        dir.path().join("a").join("entry")
    );
}

#[test]
fn fresh_entry_path_discards_stale_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path()).unwrap();
    store.write("cache", "subset", b"old").unwrap();

    let kept = store
        .entry_path_fresh("cache", "subset", SystemTime::UNIX_EPOCH)
        .unwrap();
    assert!(kept.exists(), "entry newer than the threshold is kept");

    let fresh = store
        .entry_path_fresh("cache", "subset", SystemTime::now() + Duration::from_secs(3600))
        .unwrap();
    assert_eq!(fresh, kept);
    assert!(!fresh.exists(), "entry older than the threshold is removed");
}

#[test]
fn unique_paths_do_not_collide_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path()).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                (0..50)
                    .map(|_| store.unique_path("temp", "r-", ".bin").unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for path in worker.join().unwrap() {
            assert!(path.exists());
            assert!(seen.insert(path), "duplicate unique path");
        }
    }
    assert_eq!(seen.len(), 400);
}

#[test]
fn missing_root_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("nested").join("store");
    let store = BlobStore::open(&root).unwrap();
    assert!(root.is_dir());
    assert_eq!(store.root(), root);
}
