//! Binary encoding of change items, shared by log records and backup streams.
//!
//! ```text
//! Set:    0x01 | varint key len | key | varint value len | value
//! Delete: 0x02 | varint key len | key
//! Clear:  0x03
//! ```

use integer_encoding::VarInt;

use crate::error::{KVStoreError, Result};
use crate::types::ChangeItem;

pub(crate) const OP_SET: u8 = 1;
pub(crate) const OP_DELETE: u8 = 2;
pub(crate) const OP_CLEAR: u8 = 3;

// a u64 varint never takes more than 10 bytes
const MAX_VARINT_LEN: usize = 10;

pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len = [0u8; MAX_VARINT_LEN];
    let n = (bytes.len() as u64).encode_var(&mut len);
    buf.extend_from_slice(&len[..n]);
    buf.extend_from_slice(bytes);
}

pub(crate) fn put_set(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    buf.push(OP_SET);
    put_bytes(buf, key);
    put_bytes(buf, value);
}

pub(crate) fn put_delete(buf: &mut Vec<u8>, key: &[u8]) {
    buf.push(OP_DELETE);
    put_bytes(buf, key);
}

pub(crate) fn put_item(buf: &mut Vec<u8>, item: &ChangeItem) {
    match item {
        ChangeItem::Set { key, value } => put_set(buf, key, value),
        ChangeItem::Delete { key } => put_delete(buf, key),
        ChangeItem::Clear => buf.push(OP_CLEAR),
    }
}

/// Upper bound of the encoded size of `item`.
pub(crate) fn encoded_len(item: &ChangeItem) -> usize {
    match item {
        ChangeItem::Set { key, value } => 1 + 2 * MAX_VARINT_LEN + key.len() + value.len(),
        ChangeItem::Delete { key } => 1 + MAX_VARINT_LEN + key.len(),
        ChangeItem::Clear => 1,
    }
}

/// Cursor over an encoded buffer. Every read is bounds-checked and reports
/// the failing offset as corrupt data.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(KVStoreError::corrupt(format!(
                "truncated at offset {}: need {} bytes, have {}",
                self.pos,
                n,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let (len, n) = u64::decode_var(&self.buf[self.pos..]).ok_or_else(|| {
            KVStoreError::corrupt(format!("bad length prefix at offset {}", self.pos))
        })?;
        self.pos += n;
        let len = usize::try_from(len).map_err(|_| {
            KVStoreError::corrupt(format!("length {} out of range at offset {}", len, self.pos))
        })?;
        self.take(len)
    }

    /// Decodes the item whose op byte has already been read.
    pub fn item_body(&mut self, op: u8) -> Result<ChangeItem> {
        match op {
            OP_SET => {
                let key = self.bytes()?.to_vec();
                let value = self.bytes()?.to_vec();
                Ok(ChangeItem::Set { key, value })
            }
            OP_DELETE => Ok(ChangeItem::Delete {
                key: self.bytes()?.to_vec(),
            }),
            OP_CLEAR => Ok(ChangeItem::Clear),
            op => Err(KVStoreError::corrupt(format!(
                "unknown op {:#04x} at offset {}",
                op,
                self.pos - 1
            ))),
        }
    }

    pub fn item(&mut self) -> Result<ChangeItem> {
        let op = self.u8()?;
        self.item_body(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_encoding() {
        let items = vec![
            ChangeItem::set(b"key".to_vec(), b"value".to_vec()),
            ChangeItem::set(Vec::new(), Vec::new()),
            ChangeItem::delete(b"key".to_vec()),
            ChangeItem::Clear,
        ];

        let mut buf = Vec::new();
        for item in &items {
            put_item(&mut buf, item);
        }
        assert_eq!(&buf[..11], b"\x01\x03key\x05value");

        let mut decoder = Decoder::new(&buf);
        let mut decoded = Vec::new();
        while !decoder.is_empty() {
            decoded.push(decoder.item().unwrap());
        }
        assert_eq!(decoded, items);
    }

    #[test]
    fn test_encoded_len_is_upper_bound() {
        let item = ChangeItem::set(vec![7u8; 300], vec![9u8; 70_000]);
        let mut buf = Vec::new();
        put_item(&mut buf, &item);
        assert!(buf.len() <= encoded_len(&item));
    }

    #[test]
    fn test_truncated_item() {
        let mut buf = Vec::new();
        put_set(&mut buf, b"key", b"value");
        buf.truncate(buf.len() - 1);

        let result = Decoder::new(&buf).item();
        assert!(matches!(result, Err(KVStoreError::CorruptData(_))));
    }

    #[test]
    fn test_unknown_op() {
        let result = Decoder::new(&[0x7f]).item();
        assert!(matches!(result, Err(KVStoreError::CorruptData(_))));
    }
}
