//! Log record format
//!
//! Record layout:
//! ```text
//! +--------+--------+-----------+-----------------------+
//! | CRC32  |  Len   | HeaderCRC |  Payload (Len bytes)  |
//! | 4 bytes| 4 bytes|  4 bytes  |                       |
//! +--------+--------+-----------+-----------------------+
//! ```
//!
//! - CRC32: checksum of len + payload
//! - Len: payload length, big-endian
//! - HeaderCRC: checksum of CRC32 + Len, so a damaged length is detected
//!   before it is trusted
//! - Payload: the change items of one committed batch, back to back
//!
//! A batch is one record, so replay applies it whole or not at all.

use crate::codec::{self, Decoder};
use crate::error::{KVStoreError, Result};
use crate::types::ChangeItem;

/// Record header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Maximum record payload size
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Accumulates change items into one framed record.
pub struct RecordBuilder {
    buf: Vec<u8>,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        RecordBuilder::new()
    }
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; HEADER_SIZE],
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        codec::put_set(&mut self.buf, key, value);
    }

    pub fn item(&mut self, item: &ChangeItem) {
        codec::put_item(&mut self.buf, item);
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.payload_len() == 0
    }

    /// Fills in the header and returns the encoded record.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let len = self.payload_len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(KVStoreError::CapacityExceeded {
                what: "log record size",
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.buf[4..8].copy_from_slice(&(len as u32).to_be_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf[4..8]);
        hasher.update(&self.buf[HEADER_SIZE..]);
        let crc = hasher.finalize();
        self.buf[0..4].copy_from_slice(&crc.to_be_bytes());

        let header_crc = crc32fast::hash(&self.buf[0..8]);
        self.buf[8..12].copy_from_slice(&header_crc.to_be_bytes());
        Ok(self.buf)
    }
}

/// Encodes `batch` as a single record.
pub fn encode(batch: &[ChangeItem]) -> Result<Vec<u8>> {
    let mut builder = RecordBuilder::new();
    builder.reserve(batch.iter().map(codec::encoded_len).sum());
    for item in batch {
        builder.item(item);
    }
    builder.finish()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: u64,
    /// Length of the log prefix made of complete, valid records
    pub valid_len: u64,
    /// Bytes after `valid_len` left by an interrupted write
    pub torn_bytes: u64,
}

/// Decodes every record in `log`, handing each batch to `apply` in order.
///
/// A torn write can only leave a prefix of the last record: a partial
/// header, a valid header with a short payload, or a zero-filled tail.
/// Replay stops before it and reports it in the stats. Any other damage is
/// corruption, including a damaged header with data after it.
pub fn replay(log: &[u8], mut apply: impl FnMut(Vec<ChangeItem>)) -> Result<ReplayStats> {
    let mut offset = 0;
    let mut records = 0;
    while offset < log.len() {
        match decode_at(log, offset)? {
            Some((batch, size)) => {
                apply(batch);
                offset += size;
                records += 1;
            }
            None => break,
        }
    }
    Ok(ReplayStats {
        records,
        valid_len: offset as u64,
        torn_bytes: (log.len() - offset) as u64,
    })
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// returns `None` if the record at `offset` is a torn tail.
fn decode_at(log: &[u8], offset: usize) -> Result<Option<(Vec<ChangeItem>, usize)>> {
    let rest = &log[offset..];
    if rest.len() < HEADER_SIZE {
        return Ok(None);
    }

    let stored_header_crc = read_u32(&rest[8..12]);
    if stored_header_crc != crc32fast::hash(&rest[0..8]) {
        // some filesystems leave a zero-filled tail after a crash
        if rest.len() == HEADER_SIZE || rest.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        return Err(KVStoreError::corrupt(format!(
            "log record at offset {}: header checksum mismatch",
            offset
        )));
    }

    let stored_crc = read_u32(&rest[0..4]);
    let len = read_u32(&rest[4..8]) as usize;
    if rest.len() - HEADER_SIZE < len {
        return Ok(None);
    }
    let end = HEADER_SIZE + len;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&rest[4..8]);
    hasher.update(&rest[HEADER_SIZE..end]);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        // an unsynced final payload may not have reached the disk
        if end == rest.len() {
            return Ok(None);
        }
        return Err(KVStoreError::corrupt(format!(
            "log record at offset {}: CRC mismatch, expected {:#x}, got {:#x}",
            offset, stored_crc, computed_crc
        )));
    }

    let mut decoder = Decoder::new(&rest[HEADER_SIZE..end]);
    let mut batch = Vec::new();
    while !decoder.is_empty() {
        let item = decoder.item().map_err(|e| {
            KVStoreError::corrupt(format!("log record at offset {}: {}", offset, e))
        })?;
        batch.push(item);
    }
    Ok(Some((batch, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> (Vec<u8>, usize) {
        let mut log = encode(&[ChangeItem::set(b"a".to_vec(), b"1".to_vec())]).unwrap();
        let first = log.len();
        log.extend(encode(&[ChangeItem::Clear, ChangeItem::delete(b"b".to_vec())]).unwrap());
        (log, first)
    }

    fn collect(log: &[u8]) -> Result<(Vec<Vec<ChangeItem>>, ReplayStats)> {
        let mut batches = Vec::new();
        let stats = replay(log, |batch| batches.push(batch))?;
        Ok((batches, stats))
    }

    #[test]
    fn test_replay() {
        let (log, _) = sample_log();
        let (batches, stats) = collect(&log).unwrap();

        assert_eq!(
            batches,
            vec![
                vec![ChangeItem::set(b"a".to_vec(), b"1".to_vec())],
                vec![ChangeItem::Clear, ChangeItem::delete(b"b".to_vec())],
            ]
        );
        assert_eq!(
            stats,
            ReplayStats {
                records: 2,
                valid_len: log.len() as u64,
                torn_bytes: 0
            }
        );
    }

    #[test]
    fn test_torn_tail() {
        let (log, first) = sample_log();
        for cut in [first + 1, first + HEADER_SIZE, log.len() - 1] {
            let (batches, stats) = collect(&log[..cut]).unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(stats.valid_len, first as u64);
            assert_eq!(stats.torn_bytes, (cut - first) as u64);
        }
    }

    #[test]
    fn test_damaged_last_record_is_torn() {
        let (mut log, first) = sample_log();
        let last = log.len() - 1;
        log[last] ^= 0xFF;

        let (batches, stats) = collect(&log).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(stats.valid_len, first as u64);
    }

    #[test]
    fn test_zero_filled_tail() {
        let (mut log, _) = sample_log();
        let len = log.len();
        log.extend_from_slice(&[0u8; 64]);

        let (batches, stats) = collect(&log).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(stats.valid_len, len as u64);
        assert_eq!(stats.torn_bytes, 64);
    }

    #[test]
    fn test_damaged_middle_record() {
        let (mut log, _) = sample_log();
        log[HEADER_SIZE] ^= 0xFF;

        assert!(matches!(collect(&log), Err(KVStoreError::CorruptData(_))));
    }

    #[test]
    fn test_damaged_length_is_corrupt() {
        let (log, first) = sample_log();
        // a length pointing past the end must not pass for a torn tail
        for (offset, mask) in [(4, 0x80), (7, 0x01), (first + 4, 0x80)] {
            let mut damaged = log.clone();
            damaged[offset] ^= mask;
            assert!(
                matches!(collect(&damaged), Err(KVStoreError::CorruptData(_))),
                "offset {}",
                offset
            );
        }
    }

    #[test]
    fn test_damaged_last_header_is_corrupt() {
        let (mut log, first) = sample_log();
        log[first] ^= 0x01;

        assert!(matches!(collect(&log), Err(KVStoreError::CorruptData(_))));
    }

    #[test]
    fn test_empty_batch_record() {
        let log = encode(&[]).unwrap();
        assert_eq!(log.len(), HEADER_SIZE);
        let (batches, stats) = collect(&log).unwrap();
        assert_eq!(batches, vec![Vec::<ChangeItem>::new()]);
        assert_eq!(stats.records, 1);
    }
}
