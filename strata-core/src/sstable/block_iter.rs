//! Cursor over the records of one block

use super::block::{Block, RecordSpan};
use std::sync::Arc;

/// Iterates a block in key order and seeks by binary search
pub struct BlockIterator {
    block: Arc<Block>,
    idx: usize,
    current: Option<RecordSpan>,
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            idx: 0,
            current: None,
        }
    }

    /// Create an iterator positioned on the first record
    pub fn create_and_seek_to_first(block: Arc<Block>) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_first();
        iter
    }

    /// Create an iterator positioned on the first record `>= key`
    pub fn create_and_seek_to_key(block: Arc<Block>, key: &[u8]) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_key(key);
        iter
    }

    /// Current key
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not valid.
    pub fn key(&self) -> &[u8] {
        let span = self.current.expect("invalid block iterator");
        &self.block.data[span.key.0..span.key.1]
    }

    /// Current value
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not valid.
    pub fn value(&self) -> &[u8] {
        let span = self.current.expect("invalid block iterator");
        &self.block.data[span.value.0..span.value.1]
    }

    /// True while positioned on a record
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn seek_to_first(&mut self) {
        self.seek_to(0);
    }

    /// Advance to the next record; past the end the iterator becomes invalid
    pub fn next(&mut self) {
        self.seek_to(self.idx + 1);
    }

    /// Position on the first record whose key is `>= key`, or past the end
    pub fn seek_to_key(&mut self, key: &[u8]) {
        let mut low = 0;
        let mut high = self.block.len();
        while low < high {
            let mid = low + (high - low) / 2;
            self.seek_to(mid);
            if self.key() < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        self.seek_to(low);
    }

    fn seek_to(&mut self, idx: usize) {
        self.idx = idx;
        if idx >= self.block.len() {
            self.current = None;
            return;
        }
        // blocks are validated when decoded, so a bad record here is a bug
        match self.block.record(idx) {
            Ok(span) => self.current = Some(span),
            Err(e) => {
                debug_assert!(false, "malformed record in validated block: {}", e);
                self.current = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::BlockBuilder;

    fn numbered_block(count: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(64 * 1024);
        for i in 0..count {
            let key = format!("key_{:03}", i * 2);
            let value = format!("value_{}", i);
            assert!(builder.add(key.as_bytes(), value.as_bytes()));
        }
        Arc::new(builder.build())
    }

    #[test]
    fn test_seek_to_key_lower_bound() {
        let block = numbered_block(50);

        let iter = BlockIterator::create_and_seek_to_key(block.clone(), b"key_010");
        assert_eq!(iter.key(), b"key_010");
        assert_eq!(iter.value(), b"value_5");

        // odd keys do not exist: land on the next even one
        let iter = BlockIterator::create_and_seek_to_key(block.clone(), b"key_011");
        assert_eq!(iter.key(), b"key_012");

        let iter = BlockIterator::create_and_seek_to_key(block.clone(), b"a");
        assert_eq!(iter.key(), b"key_000");

        let iter = BlockIterator::create_and_seek_to_key(block, b"zzz");
        assert!(!iter.is_valid());
    }

    #[test]
    fn test_iterate_and_reseek() {
        let block = numbered_block(10);
        let mut iter = BlockIterator::create_and_seek_to_first(block);
        let mut seen = 0;
        while iter.is_valid() {
            seen += 1;
            iter.next();
        }
        assert_eq!(seen, 10);

        iter.seek_to_first();
        assert_eq!(iter.key(), b"key_000");
        iter.seek_to_key(b"key_018");
        assert_eq!(iter.key(), b"key_018");
        iter.next();
        assert!(!iter.is_valid());
    }

    #[test]
    #[should_panic(expected = "invalid block iterator")]
    fn test_key_on_invalid_iterator_panics() {
        let mut iter = BlockIterator::create_and_seek_to_first(numbered_block(1));
        iter.next();
        let _ = iter.key();
    }
}
