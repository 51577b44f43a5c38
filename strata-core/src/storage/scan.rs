//! User-facing range scan

use crate::iterator::{LevelIterator, MergeIterator, StorageIterator, TwoMergeIterator};
use crate::memtable::MemTableIterator;
use crate::sstable::SsTableIterator;
use crate::Result;
use bytes::Bytes;
use std::ops::Bound;

/// Memtables over L0 over the sorted levels
pub(crate) type LsmIteratorInner = TwoMergeIterator<
    TwoMergeIterator<MergeIterator<MemTableIterator>, MergeIterator<SsTableIterator>>,
    MergeIterator<LevelIterator>,
>;

/// Live entries in a key range, ascending
///
/// Tombstones are skipped and iteration stops at the upper bound.
pub struct ScanIterator {
    inner: LsmIteratorInner,
    upper: Bound<Bytes>,
    is_valid: bool,
}

impl ScanIterator {
    pub(crate) fn create(inner: LsmIteratorInner, upper: Bound<&[u8]>) -> Result<Self> {
        let upper = match upper {
            Bound::Included(key) => Bound::Included(Bytes::copy_from_slice(key)),
            Bound::Excluded(key) => Bound::Excluded(Bytes::copy_from_slice(key)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let mut iter = Self {
            is_valid: inner.is_valid(),
            inner,
            upper,
        };
        iter.skip_to_live()?;
        Ok(iter)
    }

    fn step(&mut self) -> Result<()> {
        self.inner.next()?;
        if !self.inner.is_valid() {
            self.is_valid = false;
            return Ok(());
        }
        self.is_valid = self.within_upper();
        Ok(())
    }

    fn within_upper(&self) -> bool {
        match &self.upper {
            Bound::Included(end) => self.inner.key() <= end.as_ref(),
            Bound::Excluded(end) => self.inner.key() < end.as_ref(),
            Bound::Unbounded => true,
        }
    }

    fn skip_to_live(&mut self) -> Result<()> {
        self.is_valid = self.is_valid && self.within_upper();
        while self.is_valid && self.inner.value().is_empty() {
            self.step()?;
        }
        Ok(())
    }

    /// Drain the remaining entries
    pub fn collect_entries(mut self) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        while self.is_valid() {
            out.push((
                Bytes::copy_from_slice(self.key()),
                Bytes::copy_from_slice(self.value()),
            ));
            self.next()?;
        }
        Ok(out)
    }
}

impl StorageIterator for ScanIterator {
    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn next(&mut self) -> Result<()> {
        if !self.is_valid {
            return Ok(());
        }
        self.step()?;
        while self.is_valid && self.inner.value().is_empty() {
            self.step()?;
        }
        Ok(())
    }

    fn num_active_iterators(&self) -> usize {
        self.inner.num_active_iterators()
    }
}

/// True if a table spanning `[first, last]` can hold keys inside the bounds
pub(crate) fn range_overlap(
    lower: Bound<&[u8]>,
    upper: Bound<&[u8]>,
    first: &[u8],
    last: &[u8],
) -> bool {
    let above_lower = match lower {
        Bound::Included(key) => last >= key,
        Bound::Excluded(key) => last > key,
        Bound::Unbounded => true,
    };
    let below_upper = match upper {
        Bound::Included(key) => first <= key,
        Bound::Excluded(key) => first < key,
        Bound::Unbounded => true,
    };
    above_lower && below_upper
}
