use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::Result;
use crate::types::{ChangeItem, KVStore, KeyValues};

struct Shared<S> {
    store: RwLock<S>,
    // a backup stream was lost after its changes left the lineage
    needs_full: AtomicBool,
}

/// Cloneable handle that makes any store safe to use from several threads.
///
/// A backup encodes a point-in-time stream under the read lock and writes it
/// to the caller's writer after releasing it, so neither reads nor writes
/// wait on backup I/O. The stream is held in memory until it is written out.
///
/// If the caller's writer fails, the next incremental backup is written as a
/// full one, since the lost stream held changes the inner store no longer
/// tracks.
pub struct SharedStore<S> {
    inner: Arc<Shared<S>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KVStore> SharedStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Shared {
                store: RwLock::new(store),
                needs_full: AtomicBool::new(false),
            }),
        }
    }

    /// Runs `f` with shared access to the wrapped store.
    pub fn with_store<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&*self.inner.store.read())
    }

    /// Runs `f` with exclusive access to the wrapped store.
    pub fn with_store_mut<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut *self.inner.store.write())
    }
}

impl<S: KVStore> KVStore for SharedStore<S> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.store.read().get(key)
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.inner.store.write().set(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.inner.store.write().delete(key)
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.store.write().stop()
    }

    fn backup(&self, writer: &mut dyn Write, incremental: bool) -> Result<()> {
        let incremental = incremental && !self.inner.needs_full.load(Ordering::Acquire);
        let mut stream = Vec::new();
        self.inner.store.read().backup(&mut stream, incremental)?;

        if let Err(e) = writer.write_all(&stream).and_then(|()| writer.flush()) {
            warn!(error = %e, bytes = stream.len(), "backup stream lost, next backup is full");
            self.inner.needs_full.store(true, Ordering::Release);
            return Err(e.into());
        }
        if !incremental {
            self.inner.needs_full.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.inner.store.write().restore(reader)
    }

    fn get_all(&self, prefix: &[u8], descending: bool) -> Result<KeyValues> {
        self.inner.store.read().get_all(prefix, descending)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.inner.store.read().exists(key)
    }

    fn clear_all(&mut self) -> Result<()> {
        self.inner.store.write().clear_all()
    }

    fn len(&self) -> usize {
        self.inner.store.read().len()
    }

    fn write_batch(&mut self, batch: Vec<ChangeItem>) -> Result<()> {
        self.inner.store.write().write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BackupKind, Snapshot};
    use crate::MemStore;
    use std::io;
    use std::thread;
    use std::time::Duration;

    // writes a few bytes per call, slowly, and writes to the store in between
    struct SlowWriter {
        store: SharedStore<MemStore>,
        out: Vec<u8>,
        calls: u8,
    }

    impl Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            let mut guard = self
                .store
                .inner
                .store
                .try_write()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "store locked"))?;
            guard
                .set(vec![b'w', self.calls], Vec::new())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.calls = self.calls.wrapping_add(1);

            let n = buf.len().min(16);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_writers() {
        let store = SharedStore::new(MemStore::new());

        thread::scope(|s| {
            for t in 0u8..4 {
                let mut store = store.clone();
                s.spawn(move || {
                    for i in 0u8..50 {
                        store.set(vec![t, i], vec![i]).unwrap();
                    }
                });
            }
        });

        assert_eq!(store.len(), 200);
        let (keys, values) = store.get_all(&[2], false).unwrap();
        assert_eq!(keys.len(), 50);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(values[7], vec![7]);
    }

    #[test]
    fn test_with_store() {
        let store = SharedStore::new(MemStore::new());
        store
            .with_store_mut(|s| s.set(b"k".to_vec(), b"v".to_vec()))
            .unwrap();
        assert_eq!(store.with_store(|s| s.data_size()), 2);
    }

    #[test]
    fn test_slow_writer_does_not_hold_lock() {
        let mut store = SharedStore::new(MemStore::new());
        for i in 0u8..20 {
            store.set(vec![b'k', i], vec![i; 8]).unwrap();
        }

        let mut writer = SlowWriter {
            store: store.clone(),
            out: Vec::new(),
            calls: 0,
        };
        store.backup(&mut writer, false).unwrap();
        assert!(writer.calls > 1);

        // the stream holds the state from before the writes made during it
        let mut restored = MemStore::new();
        restored.restore(&mut writer.out.as_slice()).unwrap();
        assert_eq!(restored.len(), 20);
        assert!(!restored.exists(&[b'w', 0]).unwrap());
        assert_eq!(store.len(), 20 + writer.calls as usize);
    }

    #[test]
    fn test_lost_stream_forces_full_backup() {
        let mut store = SharedStore::new(MemStore::new());
        store.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.backup(&mut Vec::new(), false).unwrap();

        store.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert!(store.backup(&mut BrokenWriter, true).is_err());

        let mut out = Vec::new();
        store.backup(&mut out, true).unwrap();
        let snapshot = Snapshot::decode(&out).unwrap();
        assert_eq!(snapshot.kind, BackupKind::Full);
        assert_eq!(snapshot.items.len(), 2);

        // the chain continues from the full stream
        store.set(b"c".to_vec(), b"3".to_vec()).unwrap();
        let mut out = Vec::new();
        store.backup(&mut out, true).unwrap();
        assert_eq!(
            Snapshot::decode(&out).unwrap().items,
            vec![ChangeItem::set(b"c".to_vec(), b"3".to_vec())]
        );
    }

    #[test]
    fn test_backup_sees_one_state() {
        let mut store = SharedStore::new(MemStore::new());
        for i in 0u8..100 {
            store.set(vec![i], vec![0]).unwrap();
        }

        let backups = thread::scope(|s| {
            let mut writer = store.clone();
            s.spawn(move || {
                for round in 1u8..=20 {
                    let batch = (0u8..100).map(|i| ChangeItem::set(vec![i], vec![round])).collect();
                    writer.write_batch(batch).unwrap();
                }
            });

            let reader = store.clone();
            let handle = s.spawn(move || {
                (0..20)
                    .map(|_| {
                        let mut out = Vec::new();
                        reader.backup(&mut out, false).unwrap();
                        out
                    })
                    .collect::<Vec<_>>()
            });
            handle.join().unwrap()
        });

        // every backup holds one round for all keys
        for backup in backups {
            let mut restored = MemStore::new();
            restored.restore(&mut backup.as_slice()).unwrap();
            let (_, values) = restored.get_all(b"", false).unwrap();
            assert_eq!(values.len(), 100);
            assert!(values.windows(2).all(|w| w[0] == w[1]));
        }
    }
}
