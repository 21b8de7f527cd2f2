//! Catalog and access-control core of a scientific-data server.
//!
//! The [`catalog`] holds the namespace of served datasets and a cache of derived temporary
//! results, [`privilege`] decides which client may see which path, and [`server`] combines
//! both for request dispatchers.

pub mod catalog;
pub mod import;
/// Writer-preferring shared/exclusive lock.
pub mod lock;
pub mod privilege;
pub mod server;
/// File-backed storage for persisted state and temp results.
pub mod store;
pub mod sync;
