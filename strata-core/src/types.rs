//! Core types for Strata

use bytes::Bytes;
use std::fmt;

/// Sequence number assigned to every write
pub type SeqNum = u64;

/// Largest key the on-disk block index can describe
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// A single versioned write
///
/// An empty `value` is a tombstone: the key was deleted at `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Raw key bytes
    pub key: Bytes,
    /// Value bytes, empty for a delete
    pub value: Bytes,
    /// Write order, higher wins for equal keys
    pub sequence: SeqNum,
}

impl Entry {
    /// Create a put entry
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, sequence: SeqNum) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            sequence,
        }
    }

    /// Create a delete marker
    pub fn tombstone(key: impl Into<Bytes>, sequence: SeqNum) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
            sequence,
        }
    }

    /// True if this entry deletes its key
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Approximate resident size: key plus value length
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tombstone() {
            write!(f, "{:?} => <deleted> @{}", self.key, self.sequence)
        } else {
            write!(f, "{:?} => {:?} @{}", self.key, self.value, self.sequence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_tombstone() {
        let put = Entry::put("k", "v", 1);
        assert!(!put.is_tombstone());
        assert_eq!(put.size(), 2);

        let del = Entry::tombstone("k", 2);
        assert!(del.is_tombstone());
        assert_eq!(del.size(), 1);
        assert!(del.to_string().contains("<deleted>"));
    }
}
