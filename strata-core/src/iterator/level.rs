//! Iterator over a sorted run of non-overlapping tables

use super::StorageIterator;
use crate::sstable::{SsTable, SsTableIterator};
use crate::{Result, StrataError};
use std::sync::Arc;

/// Check that tables ascend by key range without overlapping
pub fn check_sorted_run(sstables: &[Arc<SsTable>]) -> Result<()> {
    for table in sstables {
        if table.first_key() > table.last_key() {
            return Err(StrataError::Consistency(format!(
                "SSTable {} first key sorts after its last key",
                table.id()
            )));
        }
    }
    for pair in sstables.windows(2) {
        if pair[0].last_key() >= pair[1].first_key() {
            return Err(StrataError::Consistency(format!(
                "SSTables {} and {} overlap in a sorted level",
                pair[0].id(),
                pair[1].id()
            )));
        }
    }
    Ok(())
}

/// Concatenates table iterators, opening each table only when reached
pub struct LevelIterator {
    current: Option<SsTableIterator>,
    next_sst_idx: usize,
    sstables: Vec<Arc<SsTable>>,
}

impl LevelIterator {
    pub fn create_and_seek_to_first(sstables: Vec<Arc<SsTable>>) -> Result<Self> {
        debug_assert!(check_sorted_run(&sstables).is_ok(), "unsorted level");
        let current = match sstables.first() {
            Some(table) => Some(SsTableIterator::create_and_seek_to_first(table.clone())?),
            None => None,
        };
        let mut iter = Self {
            current,
            next_sst_idx: 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    pub fn create_and_seek_to_key(sstables: Vec<Arc<SsTable>>, key: &[u8]) -> Result<Self> {
        debug_assert!(check_sorted_run(&sstables).is_ok(), "unsorted level");
        let idx = sstables
            .partition_point(|table| table.first_key().as_ref() <= key)
            .saturating_sub(1);
        let current = match sstables.get(idx) {
            Some(table) => Some(SsTableIterator::create_and_seek_to_key(table.clone(), key)?),
            None => None,
        };
        let mut iter = Self {
            current,
            next_sst_idx: idx + 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    fn move_until_valid(&mut self) -> Result<()> {
        while let Some(iter) = self.current.as_ref() {
            if iter.is_valid() {
                break;
            }
            match self.sstables.get(self.next_sst_idx) {
                Some(table) => {
                    self.current = Some(SsTableIterator::create_and_seek_to_first(table.clone())?);
                    self.next_sst_idx += 1;
                }
                None => {
                    self.current = None;
                }
            }
        }
        Ok(())
    }
}

impl StorageIterator for LevelIterator {
    fn key(&self) -> &[u8] {
        self.current.as_ref().expect("invalid level iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().expect("invalid level iterator").value()
    }

    fn is_valid(&self) -> bool {
        self.current
            .as_ref()
            .map(|iter| iter.is_valid())
            .unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = self.current.as_mut() {
            iter.next()?;
        }
        self.move_until_valid()
    }
}
