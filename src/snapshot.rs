//! Backup stream format
//!
//! ```text
//! +----------+---------+------+---------+-----+-------+---------+
//! | SMTKVBAK | Version | Kind | Item... | END | Count | SHA-256 |
//! | 8 bytes  | 2 bytes |1 byte|         |  1  |   8   |   32    |
//! +----------+---------+------+---------+-----+-------+---------+
//! ```
//!
//! - Version: format version, big-endian
//! - Kind: 0 = full snapshot, 1 = incremental delta
//! - Items: change items in the `codec` encoding
//! - Count: number of items, big-endian
//! - SHA-256: digest of every byte before it
//!
//! A full snapshot holds only `Set` items in strictly ascending key order.

use std::io::{Read, Write};

use crypto_common::Output;
use sha2::{Digest, Sha256};

use crate::codec::{self, Decoder};
use crate::error::{KVStoreError, Result};
use crate::types::ChangeItem;

pub const MAGIC: &[u8; 8] = b"SMTKVBAK";

pub const FORMAT_VERSION: u16 = 1;

const OP_END: u8 = 0xFF;

const HEADER_SIZE: usize = 8 + 2 + 1;

const TRAILER_SIZE: usize = 1 + 8 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackupKind {
    Full = 0,
    Incremental = 1,
}

impl TryFrom<u8> for BackupKind {
    type Error = KVStoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Full),
            1 => Ok(Self::Incremental),
            _ => Err(KVStoreError::corrupt(format!("unknown backup kind {}", value))),
        }
    }
}

/// Streams change items to a writer while hashing them.
pub struct SnapshotWriter<'w> {
    writer: &'w mut dyn Write,
    hasher: Sha256,
    kind: BackupKind,
    count: u64,
    buf: Vec<u8>,
}

impl<'w> SnapshotWriter<'w> {
    pub fn new(writer: &'w mut dyn Write, kind: BackupKind) -> Result<Self> {
        let mut this = Self {
            writer,
            hasher: Sha256::new(),
            kind,
            count: 0,
            buf: Vec::with_capacity(4096),
        };
        this.buf.extend_from_slice(MAGIC);
        this.buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        this.buf.push(kind as u8);
        this.emit()?;
        Ok(this)
    }

    /// Full snapshots must be written in strictly ascending key order.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        codec::put_set(&mut self.buf, key, value);
        self.count += 1;
        self.emit()
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_incremental("delete item in a full snapshot")?;
        codec::put_delete(&mut self.buf, key);
        self.count += 1;
        self.emit()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.ensure_incremental("clear item in a full snapshot")?;
        self.buf.push(codec::OP_CLEAR);
        self.count += 1;
        self.emit()
    }

    /// Writes the trailer and flushes the writer. Returns the stream digest.
    pub fn finish(mut self) -> Result<Output<Sha256>> {
        self.buf.push(OP_END);
        self.buf.extend_from_slice(&self.count.to_be_bytes());
        self.emit()?;
        let digest = self.hasher.finalize();
        self.writer.write_all(&digest)?;
        self.writer.flush()?;
        Ok(digest)
    }

    fn ensure_incremental(&self, what: &'static str) -> Result<()> {
        if self.kind == BackupKind::Full {
            return Err(KVStoreError::UnsupportedOperation(what));
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        self.hasher.update(&self.buf);
        self.writer.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

/// A decoded and verified backup stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: BackupKind,
    pub items: Vec<ChangeItem>,
}

impl Snapshot {
    /// Reads the whole stream and verifies magic, version, checksum and item layout.
    pub fn read_from(reader: &mut dyn Read) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::decode(&data)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(data);

        let magic = decoder
            .take(MAGIC.len())
            .map_err(|_| KVStoreError::corrupt("stream too short for header"))?;
        if magic != MAGIC {
            return Err(KVStoreError::corrupt("not a kvstore backup stream"));
        }
        let version = decoder
            .u16()
            .map_err(|_| KVStoreError::corrupt("stream too short for header"))?;
        if version != FORMAT_VERSION {
            return Err(KVStoreError::VersionMismatch {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        if data.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(KVStoreError::corrupt(format!(
                "stream truncated: {} bytes",
                data.len()
            )));
        }
        let (body, digest) = data.split_at(data.len() - 32);
        if Sha256::digest(body).as_slice() != digest {
            return Err(KVStoreError::corrupt("checksum mismatch"));
        }

        let kind = BackupKind::try_from(decoder.u8()?)?;
        let mut items = Vec::new();
        let mut decoder = Decoder::new(&body[HEADER_SIZE..]);
        loop {
            let op = decoder.u8()?;
            if op == OP_END {
                break;
            }
            let item = decoder.item_body(op)?;
            check_item(kind, &items, &item)?;
            items.push(item);
        }

        let count = decoder.u64()?;
        if count != items.len() as u64 {
            return Err(KVStoreError::corrupt(format!(
                "item count mismatch: trailer says {}, found {}",
                count,
                items.len()
            )));
        }
        if !decoder.is_empty() {
            return Err(KVStoreError::corrupt(format!(
                "{} unexpected bytes after trailer",
                decoder.remaining()
            )));
        }

        Ok(Self { kind, items })
    }

    /// Converts the snapshot into the batch that reproduces its state.
    ///
    /// A full snapshot starts by clearing the store; an incremental one
    /// applies on top of the current contents.
    pub fn into_batch(self) -> Vec<ChangeItem> {
        match self.kind {
            BackupKind::Full => {
                let mut batch = Vec::with_capacity(self.items.len() + 1);
                batch.push(ChangeItem::Clear);
                batch.extend(self.items);
                batch
            }
            BackupKind::Incremental => self.items,
        }
    }
}

fn check_item(kind: BackupKind, items: &[ChangeItem], item: &ChangeItem) -> Result<()> {
    match (kind, item) {
        (BackupKind::Full, ChangeItem::Set { key, .. }) => match items.last() {
            Some(ChangeItem::Set { key: last, .. }) if last >= key => Err(KVStoreError::corrupt(
                "full snapshot keys not strictly ascending",
            )),
            _ => Ok(()),
        },
        (BackupKind::Full, _) => Err(KVStoreError::corrupt(
            "full snapshot contains a non-set item",
        )),
        (BackupKind::Incremental, ChangeItem::Clear) if !items.is_empty() => Err(
            KVStoreError::corrupt("clear item must lead an incremental snapshot"),
        ),
        (BackupKind::Incremental, _) => Ok(()),
    }
}
