use std::collections::BTreeMap;
use std::io::{Read, Write};

use tracing::debug;

use crate::config::Limits;
use crate::error::{KVStoreError, Result};
use crate::keys::{prefix_range, unzip_ordered};
use crate::mergeiter::MergeIter;
use crate::snapshot::{BackupKind, SnapshotWriter};
use crate::types::{ChangeItem, KVStore, KeyValues};

/// Stages writes in memory on top of a parent store until [`flush`](Overlay::flush).
///
/// Reads see the staged changes merged over the parent. `Overlay::new(&mut store)`
/// stages over a borrowed store.
///
/// The parent only sees staged writes on flush, so its limits are enforced
/// there. Build with [`Overlay::with_limits`] to reject oversized keys and
/// values at `set` time; the entry count is still checked on flush.
pub struct Overlay<S> {
    pub parent: S,
    limits: Limits,

    // use `Option` as value to represent deletion(tombstone).
    tree: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    // parent contents are hidden by a staged clear
    cleared: bool,
    len: usize,
    stopped: bool,
}

impl<S: KVStore> Overlay<S> {
    pub fn new(parent: S) -> Self {
        Self::with_limits(parent, Limits::UNBOUNDED)
    }

    pub fn with_limits(parent: S, limits: Limits) -> Self {
        let len = parent.len();
        Self {
            parent,
            limits,
            tree: BTreeMap::new(),
            cleared: false,
            len,
            stopped: false,
        }
    }

    /// Reports whether any change is waiting to be flushed.
    pub fn is_dirty(&self) -> bool {
        self.cleared || !self.tree.is_empty()
    }

    // flush writes all the staged changes to the parent store as one batch.
    // on failure the changes stay staged.
    pub fn flush(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let mut batch = Vec::with_capacity(self.tree.len() + 1);
        if self.cleared {
            batch.push(ChangeItem::Clear);
        }
        for (key, value) in &self.tree {
            batch.push(match value {
                Some(value) => ChangeItem::set(key.clone(), value.clone()),
                None => ChangeItem::delete(key.clone()),
            });
        }
        let staged = batch.len();
        self.parent.write_batch(batch)?;

        self.tree.clear();
        self.cleared = false;
        self.len = self.parent.len();
        debug!(staged, len = self.len, "overlay flushed");
        Ok(())
    }

    /// Drops every staged change.
    pub fn discard(&mut self) {
        self.tree.clear();
        self.cleared = false;
        self.len = self.parent.len();
    }

    pub fn into_inner(self) -> S {
        self.parent
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped {
            return Err(KVStoreError::Stopped);
        }
        Ok(())
    }
}

impl<S: KVStore> KVStore for Overlay<S> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_running()?;
        match self.tree.get(key) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(KVStoreError::NotFound),
            None if self.cleared => Err(KVStoreError::NotFound),
            None => self.parent.get(key),
        }
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let exists = self.exists(&key)?;
        self.limits.check_key(&key)?;
        self.limits.check_value(&value)?;
        if !exists {
            self.len += 1;
        }
        self.tree.insert(key, Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.exists(key)? {
            self.len -= 1;
            self.tree.insert(key.to_vec(), None);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.flush()?;
        self.parent.stop()?;
        self.stopped = true;
        Ok(())
    }

    fn backup(&self, writer: &mut dyn Write, incremental: bool) -> Result<()> {
        self.ensure_running()?;
        if incremental {
            return Err(KVStoreError::UnsupportedOperation(
                "incremental backup of an overlay",
            ));
        }
        let (keys, values) = self.get_all(&[], false)?;
        let mut out = SnapshotWriter::new(writer, BackupKind::Full)?;
        for (key, value) in keys.iter().zip(&values) {
            out.set(key, value)?;
        }
        out.finish()?;
        Ok(())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.ensure_running()?;
        // an incremental stream applies on top of the staged state
        self.flush()?;
        self.parent.restore(reader)?;
        self.len = self.parent.len();
        Ok(())
    }

    fn get_all(&self, prefix: &[u8], descending: bool) -> Result<KeyValues> {
        self.ensure_running()?;
        let (keys, values) = if self.cleared {
            (Vec::new(), Vec::new())
        } else {
            self.parent.get_all(prefix, false)?
        };
        let staged = self
            .tree
            .range(prefix_range(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_deref()));
        let base = keys
            .iter()
            .map(Vec::as_slice)
            .zip(values.iter().map(Vec::as_slice));
        Ok(unzip_ordered(MergeIter::new(staged, base), descending))
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_running()?;
        match self.tree.get(key) {
            Some(value) => Ok(value.is_some()),
            None if self.cleared => Ok(false),
            None => self.parent.exists(key),
        }
    }

    fn clear_all(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.tree.clear();
        self.cleared = true;
        self.len = 0;
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }
}
