//! WAL record types and framing

use crate::{Entry, Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// WAL record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Key written with a value
    Put = 1,
    /// Key deleted
    Delete = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Put),
            2 => Ok(WalEntryType::Delete),
            _ => Err(StrataError::Corruption(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// Payload of one WAL record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub sequence: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Outcome of decoding the front of a log buffer
#[derive(Debug)]
pub enum DecodedRecord {
    /// A complete record and the number of bytes it occupied
    Record(Entry, usize),
    /// The buffer ends partway through a record
    Incomplete,
}

/// Serialize an entry with length prefix and CRC checksum
///
/// Format (little-endian):
/// - 4 bytes: length of everything after this field
/// - 1 byte: entry type
/// - N bytes: bincode-encoded [`WalRecord`]
/// - 4 bytes: CRC32 of type and payload
pub fn encode_record(entry: &Entry) -> Result<Bytes> {
    let entry_type = if entry.is_tombstone() {
        WalEntryType::Delete
    } else {
        WalEntryType::Put
    };
    let payload = bincode::serialize(&WalRecord {
        sequence: entry.sequence,
        key: entry.key.to_vec(),
        value: entry.value.to_vec(),
    })?;

    let mut buf = BytesMut::with_capacity(4 + 1 + payload.len() + 4);

    // Reserve space for length prefix
    buf.put_u32_le(0);
    buf.put_u8(entry_type as u8);
    buf.put_slice(&payload);

    // Checksum excludes the length prefix
    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    let len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());

    Ok(buf.freeze())
}

/// Decode the record at the front of `data`, validating its checksum
pub fn decode_record(data: &[u8]) -> Result<DecodedRecord> {
    if data.len() < 4 {
        return Ok(DecodedRecord::Incomplete);
    }

    let len = (&data[..4]).get_u32_le() as usize;
    if data.len() < 4 + len {
        return Ok(DecodedRecord::Incomplete);
    }
    if len < 1 + 4 {
        return Err(StrataError::Corruption(format!("WAL record length {} too small", len)));
    }

    let body = &data[4..4 + len];
    let (content, mut checksum) = body.split_at(body.len() - 4);
    let expected = checksum.get_u32_le();
    let actual = crc32fast::hash(content);
    if expected != actual {
        return Err(StrataError::ChecksumMismatch { expected, actual });
    }

    let entry_type = WalEntryType::try_from(content[0])?;
    let record: WalRecord = bincode::deserialize(&content[1..])?;
    let is_delete = record.value.is_empty();
    if is_delete != (entry_type == WalEntryType::Delete) {
        return Err(StrataError::Corruption(format!(
            "WAL record type {:?} disagrees with its value",
            entry_type
        )));
    }

    let entry = Entry::put(record.key, record.value, record.sequence);
    Ok(DecodedRecord::Record(entry, 4 + len))
}
