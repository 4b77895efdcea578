use std::io::{Read, Write};

use crate::error::Result;

/// Matching keys and their values, paired by index.
pub type KeyValues = (Vec<Vec<u8>>, Vec<Vec<u8>>);

/// A single mutation, used by batches, log records and backup streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeItem {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Clear,
}

impl ChangeItem {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        ChangeItem::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        ChangeItem::Delete { key: key.into() }
    }
}

/// Key-value store usable standalone or as the node store of a Sparse Merkle Tree.
///
/// Keys and values are arbitrary byte strings; keys are ordered by unsigned
/// lexicographic byte comparison and the empty key is a valid key. Reads take
/// `&self` and mutations take `&mut self`, so access to one instance is
/// serialized by the borrow checker. [`SharedStore`](crate::SharedStore) is
/// the wrapper for concurrent use.
///
/// A successful mutation is fully applied and durable according to the
/// backend's sync policy. A failed mutation leaves the store unchanged.
/// Once [`stop`](KVStore::stop) returns `Ok`, every other fallible method
/// fails with [`Stopped`](crate::KVStoreError::Stopped).
pub trait KVStore {
    // store methods

    /// Returns the value currently associated with `key`, or `NotFound`.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Inserts or replaces the value for `key`.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    /// Removes `key`. Deleting an absent key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    // lifecycle methods

    /// Releases every resource held by the store. Calling it again returns `Ok`.
    fn stop(&mut self) -> Result<()>;

    // data methods

    /// Writes a self-describing snapshot of the store to `writer`.
    ///
    /// With `incremental`, only the changes since the last successful backup
    /// are written; a store that has never been backed up writes a full
    /// snapshot instead. The writer stays owned by the caller.
    fn backup(&self, writer: &mut dyn Write, incremental: bool) -> Result<()>;

    /// Replaces the store contents with the state encoded in `reader`.
    ///
    /// Either the whole stream is applied or nothing is: on error the store
    /// keeps its previous contents.
    fn restore(&mut self, reader: &mut dyn Read) -> Result<()>;

    // accessors

    /// Returns every key starting with `prefix` and its value, ordered by key
    /// bytes ascending, or descending when `descending` is set. An empty
    /// prefix matches every key.
    fn get_all(&self, prefix: &[u8], descending: bool) -> Result<KeyValues>;

    /// Reports whether `key` is present without copying its value.
    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Removes every key.
    fn clear_all(&mut self) -> Result<()>;

    /// Number of distinct keys currently present.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `batch` in order.
    ///
    /// The default applies items one at a time and may stop halfway on error;
    /// backends that can commit a batch atomically override it.
    fn write_batch(&mut self, batch: Vec<ChangeItem>) -> Result<()> {
        for item in batch {
            match item {
                ChangeItem::Set { key, value } => self.set(key, value)?,
                ChangeItem::Delete { key } => self.delete(&key)?,
                ChangeItem::Clear => self.clear_all()?,
            }
        }
        Ok(())
    }
}

macro_rules! forward_kvstore {
    () => {
        fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
            (**self).get(key)
        }

        fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
            (**self).set(key, value)
        }

        fn delete(&mut self, key: &[u8]) -> Result<()> {
            (**self).delete(key)
        }

        fn stop(&mut self) -> Result<()> {
            (**self).stop()
        }

        fn backup(&self, writer: &mut dyn Write, incremental: bool) -> Result<()> {
            (**self).backup(writer, incremental)
        }

        fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
            (**self).restore(reader)
        }

        fn get_all(&self, prefix: &[u8], descending: bool) -> Result<KeyValues> {
            (**self).get_all(prefix, descending)
        }

        fn exists(&self, key: &[u8]) -> Result<bool> {
            (**self).exists(key)
        }

        fn clear_all(&mut self) -> Result<()> {
            (**self).clear_all()
        }

        fn len(&self) -> usize {
            (**self).len()
        }

        fn write_batch(&mut self, batch: Vec<ChangeItem>) -> Result<()> {
            (**self).write_batch(batch)
        }
    };
}

impl<S: KVStore + ?Sized> KVStore for &mut S {
    forward_kvstore!();
}

impl<S: KVStore + ?Sized> KVStore for Box<S> {
    forward_kvstore!();
}
