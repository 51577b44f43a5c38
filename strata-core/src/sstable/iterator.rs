//! Iterator over every record of one SSTable

use super::{BlockIterator, SsTable};
use crate::iterator::StorageIterator;
use crate::Result;
use std::sync::Arc;

/// Chains the block iterators of a table, crossing block boundaries
pub struct SsTableIterator {
    table: Arc<SsTable>,
    block_iter: BlockIterator,
    block_idx: usize,
}

impl SsTableIterator {
    /// Create an iterator on the table's first record
    pub fn create_and_seek_to_first(table: Arc<SsTable>) -> Result<Self> {
        let block_iter = BlockIterator::create_and_seek_to_first(table.read_block(0)?);
        Ok(Self {
            table,
            block_iter,
            block_idx: 0,
        })
    }

    /// Create an iterator on the first record `>= key`
    pub fn create_and_seek_to_key(table: Arc<SsTable>, key: &[u8]) -> Result<Self> {
        let (block_idx, block_iter) = Self::seek_to_key_inner(&table, key)?;
        Ok(Self {
            table,
            block_iter,
            block_idx,
        })
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.block_idx = 0;
        self.block_iter = BlockIterator::create_and_seek_to_first(self.table.read_block(0)?);
        Ok(())
    }

    pub fn seek_to_key(&mut self, key: &[u8]) -> Result<()> {
        let (block_idx, block_iter) = Self::seek_to_key_inner(&self.table, key)?;
        self.block_idx = block_idx;
        self.block_iter = block_iter;
        Ok(())
    }

    fn seek_to_key_inner(table: &SsTable, key: &[u8]) -> Result<(usize, BlockIterator)> {
        let mut block_idx = table.find_block_idx(key);
        let mut block_iter = BlockIterator::create_and_seek_to_key(table.read_block(block_idx)?, key);
        // key sorts after everything in this block: start at the next one
        if !block_iter.is_valid() && block_idx + 1 < table.num_blocks() {
            block_idx += 1;
            block_iter = BlockIterator::create_and_seek_to_first(table.read_block(block_idx)?);
        }
        Ok((block_idx, block_iter))
    }

    pub fn table(&self) -> &Arc<SsTable> {
        &self.table
    }
}

impl StorageIterator for SsTableIterator {
    fn key(&self) -> &[u8] {
        self.block_iter.key()
    }

    fn value(&self) -> &[u8] {
        self.block_iter.value()
    }

    fn is_valid(&self) -> bool {
        self.block_iter.is_valid()
    }

    fn next(&mut self) -> Result<()> {
        self.block_iter.next();
        if !self.block_iter.is_valid() && self.block_idx + 1 < self.table.num_blocks() {
            self.block_idx += 1;
            self.block_iter =
                BlockIterator::create_and_seek_to_first(self.table.read_block(self.block_idx)?);
        }
        Ok(())
    }
}
