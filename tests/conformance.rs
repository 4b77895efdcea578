//! Runs the shared conformance suite against every backend.

use smt_kvstore::{conformance, KVStore, LogStore, MemStore, OpenMode, Overlay, SharedStore, StoreConfig};
use tempfile::TempDir;

// keeps every directory alive until the suite finishes
struct Dirs(Vec<TempDir>);

impl Dirs {
    fn new() -> Self {
        Dirs(Vec::new())
    }

    fn log_store(&mut self) -> LogStore {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), OpenMode::Create, StoreConfig::default()).unwrap();
        self.0.push(dir);
        store
    }
}

#[test]
fn test_mem_store() {
    conformance::run_all(MemStore::new);
}

#[test]
fn test_log_store() {
    let mut dirs = Dirs::new();
    conformance::run_all(|| dirs.log_store());
}

#[test]
fn test_overlay_over_mem_store() {
    conformance::run_all(|| Overlay::new(MemStore::new()));
}

#[test]
fn test_overlay_over_log_store() {
    let mut dirs = Dirs::new();
    conformance::run_all(|| Overlay::new(dirs.log_store()));
}

#[test]
fn test_shared_store() {
    conformance::run_all(|| SharedStore::new(MemStore::new()));
}

#[test]
fn test_boxed_store() {
    let mut dirs = Dirs::new();
    let mut count = 0;
    conformance::run_all(|| -> Box<dyn KVStore> {
        count += 1;
        if count % 2 == 0 {
            Box::new(dirs.log_store())
        } else {
            Box::new(MemStore::new())
        }
    });
}
