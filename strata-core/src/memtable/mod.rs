//! MemTable implementation using a concurrent skip map
//!
//! The MemTable is an in-memory data structure that stores recent writes
//! in sorted order, allowing for fast writes and efficient range scans.
//! It keeps only the latest version of each key; a delete is stored as an
//! empty value so that it shadows older generations until compacted away.

use crate::iterator::StorageIterator;
use crate::sstable::SsTableBuilder;
use crate::wal::{SyncPolicy, Wal, WalReader, WriteAheadLog};
use crate::{Entry, Result, SeqNum};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Latest version of a key
#[derive(Debug, Clone)]
struct MemValue {
    value: Bytes,
    sequence: SeqNum,
}

/// MemTable for in-memory writes
pub struct MemTable {
    id: usize,
    map: Arc<SkipMap<Bytes, MemValue>>,
    wal: Option<Wal>,
    /// Sum of key and value lengths of the live versions
    approximate_size: AtomicI64,
    max_sequence: AtomicU64,
}

impl MemTable {
    /// Create a MemTable without a log
    pub fn create(id: usize) -> Self {
        Self {
            id,
            map: Arc::new(SkipMap::new()),
            wal: None,
            approximate_size: AtomicI64::new(0),
            max_sequence: AtomicU64::new(0),
        }
    }

    /// Create a MemTable that logs every write to a new file at `path`
    pub fn create_with_wal(id: usize, path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        Ok(Self {
            wal: Some(Wal::create(path, sync_policy)?),
            ..Self::create(id)
        })
    }

    /// Rebuild a MemTable from the log at `path` and keep logging to it
    pub fn recover_from_wal(id: usize, path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let memtable = Self::create(id);
        for entry in WalReader::read(path.as_ref())? {
            memtable.apply(&entry);
        }
        Ok(Self {
            wal: Some(Wal::open(path, sync_policy)?),
            ..memtable
        })
    }

    /// Get the MemTable ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Insert or overwrite a key, logging it first when a WAL is attached
    pub fn put(&self, entry: &Entry) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.append(entry)?;
        }
        self.apply(entry);
        Ok(())
    }

    fn apply(&self, entry: &Entry) {
        let new_len = entry.value.len() as i64;
        let delta = match self.map.get(&entry.key) {
            Some(existing) if existing.value().sequence > entry.sequence => return,
            Some(existing) => new_len - existing.value().value.len() as i64,
            None => entry.key.len() as i64 + new_len,
        };

        self.map.insert(
            entry.key.clone(),
            MemValue {
                value: entry.value.clone(),
                sequence: entry.sequence,
            },
        );
        self.approximate_size.fetch_add(delta, Ordering::Relaxed);
        self.max_sequence.fetch_max(entry.sequence, Ordering::Relaxed);
    }

    /// Point lookup
    ///
    /// `Some` with an empty value means the key was deleted here, which is
    /// final; `None` means older generations must be consulted.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.map.get(key).map(|e| Entry {
            key: e.key().clone(),
            value: e.value().value.clone(),
            sequence: e.value().sequence,
        })
    }

    /// Live entries with keys in `[start, end]`, ascending
    ///
    /// The iterator is lazy; call again to restart it.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> MemTableIterator {
        MemTableIterator::create(
            self.map.clone(),
            Bound::Included(Bytes::copy_from_slice(start)),
            Bound::Included(Bytes::copy_from_slice(end)),
            false,
        )
    }

    /// Every version in range, tombstones included, for merging with older data
    pub fn iter_range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> MemTableIterator {
        MemTableIterator::create(self.map.clone(), to_owned_bound(lower), to_owned_bound(upper), true)
    }

    /// Feed every record, tombstones included, into an SSTable builder
    pub fn flush(&self, builder: &mut SsTableBuilder) -> Result<()> {
        for entry in self.map.iter() {
            builder.add(entry.key(), &entry.value().value);
        }
        Ok(())
    }

    /// Force the attached log to disk
    pub fn sync_wal(&self) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.sync(),
            None => Ok(()),
        }
    }

    /// Path of the attached log, if any
    pub fn wal_path(&self) -> Option<&Path> {
        self.wal.as_ref().map(|wal| wal.path())
    }

    /// Approximate size in bytes
    pub fn size(&self) -> i64 {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Highest sequence number applied
    pub fn max_sequence(&self) -> SeqNum {
        self.max_sequence.load(Ordering::Relaxed)
    }

    /// Number of distinct keys, deletes included
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn borrow_bound(bound: &Bound<Bytes>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_ref()),
        Bound::Excluded(key) => Bound::Excluded(key.as_ref()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn to_owned_bound(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Bound::Included(key) => Bound::Included(Bytes::copy_from_slice(key)),
        Bound::Excluded(key) => Bound::Excluded(Bytes::copy_from_slice(key)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Lazy cursor over a MemTable range
///
/// Holds a handle to the map rather than a borrow, and re-seeks past the
/// current key on every step, so it observes writes made after creation.
pub struct MemTableIterator {
    map: Arc<SkipMap<Bytes, MemValue>>,
    upper: Bound<Bytes>,
    include_tombstones: bool,
    current: Option<(Bytes, Bytes)>,
}

impl MemTableIterator {
    fn create(
        map: Arc<SkipMap<Bytes, MemValue>>,
        lower: Bound<Bytes>,
        upper: Bound<Bytes>,
        include_tombstones: bool,
    ) -> Self {
        let mut iter = Self {
            map,
            upper,
            include_tombstones,
            current: None,
        };
        iter.seek(borrow_bound(&lower));
        iter
    }

    fn seek(&mut self, lower: Bound<&[u8]>) {
        let mut next = self.lookup(lower);
        while let Some((key, value)) = next {
            if !self.within_upper(&key) {
                break;
            }
            if value.is_empty() && !self.include_tombstones {
                next = self.lookup(Bound::Excluded(key.as_ref()));
                continue;
            }
            self.current = Some((key, value));
            return;
        }
        self.current = None;
    }

    fn lookup(&self, lower: Bound<&[u8]>) -> Option<(Bytes, Bytes)> {
        self.map
            .lower_bound(lower)
            .map(|e| (e.key().clone(), e.value().value.clone()))
    }

    fn within_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Bound::Included(end) => key <= end.as_ref(),
            Bound::Excluded(end) => key < end.as_ref(),
            Bound::Unbounded => true,
        }
    }

    /// Current entry as an owned value
    pub fn entry(&self) -> Option<(Bytes, Bytes)> {
        self.current.clone()
    }
}

impl StorageIterator for MemTableIterator {
    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("invalid memtable iterator").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("invalid memtable iterator").1
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.seek(Bound::Excluded(key.as_ref()));
        }
        Ok(())
    }
}
