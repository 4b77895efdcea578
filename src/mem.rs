use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::ops::RangeBounds;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Limits;
use crate::error::{KVStoreError, Result};
use crate::keys::{prefix_range, unzip_ordered};
use crate::snapshot::{BackupKind, Snapshot, SnapshotWriter};
use crate::tracker::{ChangeTracker, Delta};
use crate::types::{ChangeItem, KVStore, KeyValues};

/// Ordered in-memory store.
///
/// Unbounded unless built with [`MemStore::with_limits`]. Supports full and
/// incremental backups.
pub struct MemStore {
    tree: BTreeMap<Vec<u8>, Vec<u8>>,
    limits: Limits,
    // bytes of keys plus values currently stored
    data_size: usize,
    tracker: Mutex<ChangeTracker>,
    stopped: bool,
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_limits(Limits::UNBOUNDED)
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            tree: BTreeMap::new(),
            limits,
            data_size: 0,
            tracker: Mutex::new(ChangeTracker::default()),
            stopped: false,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn range<R>(&self, bounds: R) -> impl DoubleEndedIterator<Item = (&[u8], &[u8])>
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.tree
            .range(bounds)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Validates `batch` against the limits without applying it.
    pub(crate) fn check_batch(&self, batch: &[ChangeItem]) -> Result<()> {
        let count_entries = self.limits.max_entries.is_some();
        let mut count = self.tree.len();
        let mut cleared = false;
        // presence of keys already touched by earlier items of the batch
        let mut touched: BTreeMap<&[u8], bool> = BTreeMap::new();

        for item in batch {
            match item {
                ChangeItem::Set { key, value } => {
                    self.limits.check_key(key)?;
                    self.limits.check_value(value)?;
                    if count_entries {
                        if !self.present_after(&touched, cleared, key) {
                            count += 1;
                            self.limits.check_entries(count)?;
                        }
                        touched.insert(key, true);
                    }
                }
                ChangeItem::Delete { key } => {
                    if count_entries {
                        if self.present_after(&touched, cleared, key) {
                            count -= 1;
                        }
                        touched.insert(key, false);
                    }
                }
                ChangeItem::Clear => {
                    count = 0;
                    cleared = true;
                    touched.clear();
                }
            }
        }
        Ok(())
    }

    fn present_after(&self, touched: &BTreeMap<&[u8], bool>, cleared: bool, key: &[u8]) -> bool {
        match touched.get(key) {
            Some(present) => *present,
            None => !cleared && self.tree.contains_key(key),
        }
    }

    /// Applies an already validated batch.
    pub(crate) fn apply(&mut self, batch: Vec<ChangeItem>) {
        for item in batch {
            self.apply_item(item);
        }
    }

    fn apply_item(&mut self, item: ChangeItem) {
        self.tracker.get_mut().record(&item);
        match item {
            ChangeItem::Set { key, value } => {
                let key_len = key.len();
                self.data_size += key_len + value.len();
                if let Some(old) = self.tree.insert(key, value) {
                    self.data_size -= key_len + old.len();
                }
            }
            ChangeItem::Delete { key } => {
                if let Some(old) = self.tree.remove(&key) {
                    self.data_size -= key.len() + old.len();
                }
            }
            ChangeItem::Clear => {
                self.tree.clear();
                self.data_size = 0;
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped {
            return Err(KVStoreError::Stopped);
        }
        Ok(())
    }

    fn write_delta(&self, writer: &mut dyn Write, delta: Delta) -> Result<()> {
        match delta {
            Delta::Full => {
                let mut out = SnapshotWriter::new(writer, BackupKind::Full)?;
                for (key, value) in &self.tree {
                    out.set(key, value)?;
                }
                out.finish()?;
                debug!(keys = self.tree.len(), "wrote full backup");
            }
            Delta::Changes { cleared, keys } => {
                let mut out = SnapshotWriter::new(writer, BackupKind::Incremental)?;
                if cleared {
                    out.clear()?;
                }
                for key in &keys {
                    match self.tree.get(key) {
                        Some(value) => out.set(key, value)?,
                        None if cleared => {}
                        None => out.delete(key)?,
                    }
                }
                out.finish()?;
                debug!(keys = keys.len(), cleared, "wrote incremental backup");
            }
        }
        Ok(())
    }
}

impl KVStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_running()?;
        self.tree.get(key).cloned().ok_or(KVStoreError::NotFound)
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        self.limits.check_key(&key)?;
        self.limits.check_value(&value)?;
        if !self.tree.contains_key(&key) {
            self.limits.check_entries(self.tree.len() + 1)?;
        }
        self.apply_item(ChangeItem::Set { key, value });
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_running()?;
        if self.tree.contains_key(key) {
            self.apply_item(ChangeItem::delete(key));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.stopped {
            self.tree = BTreeMap::new();
            self.data_size = 0;
            self.stopped = true;
            debug!("memory store stopped");
        }
        Ok(())
    }

    fn backup(&self, writer: &mut dyn Write, incremental: bool) -> Result<()> {
        self.ensure_running()?;
        let (delta, pending) = self.tracker.lock().begin(incremental);
        match self.write_delta(writer, delta) {
            Ok(()) => {
                self.tracker.lock().commit();
                Ok(())
            }
            Err(e) => {
                self.tracker.lock().abort(pending);
                Err(e)
            }
        }
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.ensure_running()?;
        let snapshot = Snapshot::read_from(reader)?;
        let kind = snapshot.kind;
        self.write_batch(snapshot.into_batch())?;
        debug!(?kind, keys = self.tree.len(), "memory store restored");
        Ok(())
    }

    fn get_all(&self, prefix: &[u8], descending: bool) -> Result<KeyValues> {
        self.ensure_running()?;
        Ok(unzip_ordered(self.range(prefix_range(prefix)), descending))
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_running()?;
        Ok(self.tree.contains_key(key))
    }

    fn clear_all(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.apply_item(ChangeItem::Clear);
        Ok(())
    }

    fn len(&self) -> usize {
        self.tree.len()
    }

    fn write_batch(&mut self, batch: Vec<ChangeItem>) -> Result<()> {
        self.ensure_running()?;
        self.check_batch(&batch)?;
        self.apply(batch);
        Ok(())
    }
}
