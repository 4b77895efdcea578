//! Pluggable key-value storage backends for Sparse Merkle Tree nodes.
//!
//! [`KVStore`] is the contract a tree uses to persist its nodes. Backends:
//!
//! - [`MemStore`]: ordered in-memory map, with full and incremental backups.
//! - [`LogStore`]: disk-backed append-only log with an in-memory index.
//! - [`Overlay`]: stages writes over any other store until flushed.
//! - [`SharedStore`]: cloneable handle for concurrent access.
//!
//! Every backend passes [`conformance::run_all`].

mod codec;
pub mod config;
pub mod conformance;
pub mod error;
pub mod keys;
pub mod log;
mod mem;
mod mergeiter;
mod overlay;
mod shared;
pub mod snapshot;
mod tracker;
mod types;

pub use config::{Limits, StoreConfig, SyncPolicy};
pub use error::{KVStoreError, Result};
pub use keys::{prefix_range, prefix_successor};
pub use log::{LogStore, OpenMode};
pub use mem::MemStore;
pub use mergeiter::MergeIter;
pub use overlay::Overlay;
pub use shared::SharedStore;
pub use snapshot::{BackupKind, Snapshot, SnapshotWriter};
pub use types::{ChangeItem, KVStore, KeyValues};
