//! SSTable data block implementation
//!
//! Encoding:
//!
//! ```text
//! | record #1 | ... | record #N | offset #1 (u16) | ... | offset #N (u16) | N (u16) |
//! record = varint(key_len) | key | varint(value_len) | value
//! ```
//!
//! All fixed-width integers are big-endian.

use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Width of one entry in the offset table, and of the trailing count
pub(crate) const SIZEOF_U16: usize = std::mem::size_of::<u16>();

/// Append `value` as an unsigned LEB128 varint
pub(crate) fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Number of bytes `put_varint` emits for `value`
pub(crate) fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Decode a varint from the front of `data`, returning `(value, bytes_read)`
pub(crate) fn get_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(StrataError::Corruption("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(StrataError::Corruption("truncated varint".into()))
}

/// Byte ranges of one decoded record inside `Block::data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordSpan {
    pub key: (usize, usize),
    pub value: (usize, usize),
}

/// A sealed, immutable block of sorted records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub(crate) data: Bytes,
    pub(crate) offsets: Vec<u16>,
}

impl Block {
    /// Serialize as `data || offsets || count`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.data.len() + (self.offsets.len() + 1) * SIZEOF_U16,
        );
        buf.put_slice(&self.data);
        for offset in &self.offsets {
            buf.put_u16(*offset);
        }
        buf.put_u16(self.offsets.len() as u16);
        buf.freeze()
    }

    /// Deserialize a block, validating every record it indexes
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < SIZEOF_U16 {
            return Err(StrataError::Corruption(format!(
                "block too short: {} bytes",
                raw.len()
            )));
        }

        let count = (&raw[raw.len() - SIZEOF_U16..]).get_u16() as usize;
        let trailer = SIZEOF_U16 + count * SIZEOF_U16;
        if trailer > raw.len() {
            return Err(StrataError::Corruption(format!(
                "block declares {} offsets but holds {} bytes",
                count,
                raw.len()
            )));
        }

        let data_end = raw.len() - trailer;
        let mut offset_buf = &raw[data_end..raw.len() - SIZEOF_U16];
        let offsets: Vec<u16> = (0..count).map(|_| offset_buf.get_u16()).collect();

        let block = Self {
            data: Bytes::copy_from_slice(&raw[..data_end]),
            offsets,
        };
        block.validate()?;
        Ok(block)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True if the block holds no records
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Key of the first record
    pub fn first_key(&self) -> Result<Bytes> {
        let span = self.record(0)?;
        Ok(self.data.slice(span.key.0..span.key.1))
    }

    /// Locate the key and value of record `idx`
    pub(crate) fn record(&self, idx: usize) -> Result<RecordSpan> {
        let start = *self.offsets.get(idx).ok_or_else(|| {
            StrataError::Corruption(format!("record index {} out of range", idx))
        })? as usize;
        let end = self
            .offsets
            .get(idx + 1)
            .map(|o| *o as usize)
            .unwrap_or(self.data.len());
        if start >= end || end > self.data.len() {
            return Err(StrataError::Corruption(format!(
                "record {} spans {}..{} in {} bytes of data",
                idx,
                start,
                end,
                self.data.len()
            )));
        }

        let record = &self.data[start..end];
        let (key_len, n) = get_varint(record)?;
        let key_start = start + n;
        // lengths come from disk; compare before casting
        if key_len > (end - key_start) as u64 {
            return Err(StrataError::Corruption(format!("record {} key overruns", idx)));
        }
        let key_end = key_start + key_len as usize;
        let (value_len, n) = get_varint(&self.data[key_end..end])?;
        let value_start = key_end + n;
        if value_len != (end - value_start) as u64 {
            return Err(StrataError::Corruption(format!(
                "record {} value length {} does not fill {} bytes",
                idx,
                value_len,
                end - value_start
            )));
        }
        let value_end = end;

        Ok(RecordSpan {
            key: (key_start, key_end),
            value: (value_start, value_end),
        })
    }

    fn validate(&self) -> Result<()> {
        if let Some(first) = self.offsets.first() {
            if *first != 0 {
                return Err(StrataError::Corruption("first record not at offset 0".into()));
            }
        }
        for pair in self.offsets.windows(2) {
            if pair[0] >= pair[1] {
                return Err(StrataError::Corruption(
                    "block offsets not strictly increasing".into(),
                ));
            }
        }
        for idx in 0..self.offsets.len() {
            self.record(idx)?;
        }
        Ok(())
    }
}

/// Packs sorted records into a block until the size budget is reached
pub struct BlockBuilder {
    offsets: Vec<u16>,
    data: BytesMut,
    block_size: usize,
    first_key: Bytes,
    last_key: Bytes,
}

impl BlockBuilder {
    /// Create a builder targeting `block_size` encoded bytes
    pub fn new(block_size: usize) -> Self {
        Self {
            offsets: Vec::new(),
            data: BytesMut::new(),
            block_size,
            first_key: Bytes::new(),
            last_key: Bytes::new(),
        }
    }

    /// Size the block would have if sealed now
    pub fn estimated_size(&self) -> usize {
        SIZEOF_U16 + self.offsets.len() * SIZEOF_U16 + self.data.len()
    }

    /// Append a record; returns false (and changes nothing) if it does not fit
    ///
    /// Keys must arrive in ascending order. An empty builder accepts any
    /// record, however large.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> bool {
        let record_len = varint_len(key.len() as u64)
            + key.len()
            + varint_len(value.len() as u64)
            + value.len();
        if !self.is_empty() && self.estimated_size() + record_len + SIZEOF_U16 > self.block_size
        {
            return false;
        }

        self.offsets.push(self.data.len() as u16);
        put_varint(&mut self.data, key.len() as u64);
        self.data.put_slice(key);
        put_varint(&mut self.data, value.len() as u64);
        self.data.put_slice(value);

        if self.first_key.is_empty() {
            self.first_key = Bytes::copy_from_slice(key);
        }
        self.last_key = Bytes::copy_from_slice(key);
        true
    }

    /// Check if block has data
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// First key added
    pub fn first_key(&self) -> &Bytes {
        &self.first_key
    }

    /// Most recent key added
    pub fn last_key(&self) -> &Bytes {
        &self.last_key
    }

    /// Seal the block
    ///
    /// # Panics
    ///
    /// Panics if no record was added.
    pub fn build(self) -> Block {
        assert!(!self.is_empty(), "block should not be empty");
        Block {
            data: self.data.freeze(),
            offsets: self.offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::BlockIterator;
    use std::sync::Arc;

    #[test]
    fn test_varint() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            assert_eq!(get_varint(&buf).unwrap(), (value, buf.len()));
        }
        assert!(get_varint(&[0x80, 0x80]).unwrap_err().is_corruption());
        assert!(get_varint(&[0xff; 11]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_four_key_block() {
        let mut builder = BlockBuilder::new(4096);
        assert!(builder.add(b"apple", b"value1"));
        assert!(builder.add(b"application", &[13, 14, 255]));
        assert!(builder.add(b"apricot", b"val2"));
        assert!(builder.add(b"banana", b"value3"));
        assert_eq!(builder.first_key().as_ref(), b"apple");
        assert_eq!(builder.last_key().as_ref(), b"banana");

        let block = builder.build();
        let decoded = Arc::new(Block::decode(&block.encode()).unwrap());
        assert_eq!(*decoded, block);

        let mut iter = BlockIterator::create_and_seek_to_first(decoded);
        let expected: [(&[u8], &[u8]); 4] = [
            (b"apple", b"value1"),
            (b"application", &[13, 14, 255]),
            (b"apricot", b"val2"),
            (b"banana", b"value3"),
        ];
        for (key, value) in expected {
            assert!(iter.is_valid());
            assert_eq!(iter.key(), key);
            assert_eq!(iter.value(), value);
            iter.next();
        }
        assert!(!iter.is_valid());
    }

    #[test]
    fn test_size_budget() {
        let mut builder = BlockBuilder::new(64);
        let value = [7u8; 20];
        let mut added = 0;
        while builder.add(format!("key{:03}", added).as_bytes(), &value) {
            added += 1;
        }
        assert!(added >= 1);
        let before = builder.estimated_size();
        assert!(before <= 64);
        // rejected add must not mutate
        assert!(!builder.add(b"zzz", &value));
        assert_eq!(builder.estimated_size(), before);
        assert_eq!(builder.build().len(), added);
    }

    #[test]
    fn test_oversized_first_record() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.add(b"big", &[1u8; 100]));
        assert!(!builder.add(b"next", b"v"));
        let block = builder.build();
        assert!(block.encode().len() > 16);
    }

    #[test]
    #[should_panic(expected = "block should not be empty")]
    fn test_build_empty_panics() {
        BlockBuilder::new(4096).build();
    }

    #[test]
    fn test_decode_corruption() {
        assert!(Block::decode(&[0x01]).unwrap_err().is_corruption());
        // declares 2 offsets with only 3 bytes present
        assert!(Block::decode(&[0x45, 0x00, 0x02]).unwrap_err().is_corruption());

        let mut builder = BlockBuilder::new(4096);
        builder.add(b"k1", b"v1");
        builder.add(b"k2", b"v2");
        let mut raw = builder.build().encode().to_vec();
        // turn the first key length into an unterminated varint
        raw[0] = 0xff;
        assert!(Block::decode(&raw).unwrap_err().is_corruption());

        // key length of u64::MAX, one offset at 0, count 1
        let mut huge = vec![0xff; 9];
        huge.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(Block::decode(&huge).unwrap_err().is_corruption());

        // value length of u64::MAX after a one-byte key
        let mut huge = vec![0x01, b'k'];
        huge.extend_from_slice(&[0xff; 9]);
        huge.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(Block::decode(&huge).unwrap_err().is_corruption());
    }
}
