//! The LSM tree: write path, read path, freezing and flushing

use super::manifest::{Manifest, ManifestSnapshot};
use super::scan::{range_overlap, ScanIterator};
use super::{sync_dir, LsmState, StorageOptions, StorageStats};
use crate::compaction::CompactionController;
use crate::iterator::{
    check_sorted_run, LevelIterator, MergeIterator, StorageIterator, TwoMergeIterator,
};
use crate::memtable::MemTable;
use crate::sstable::{
    parse_sst_id, sst_path, FileObject, SsTable, SsTableBuilder, SsTableIterator,
};
use crate::wal::{wal_path, WalReader};
use crate::{Entry, Result, StrataError, MAX_KEY_LEN};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// LSM tree over one directory
///
/// `state` is swapped wholesale on every structural change. `state_lock`
/// serializes those changes (freeze, flush, compaction install) so each one
/// starts from the latest version; readers never take it.
pub struct LsmStore {
    pub(crate) state: Arc<RwLock<Arc<LsmState>>>,
    pub(crate) state_lock: Mutex<()>,
    /// Held for the whole of a compaction so two never pick the same tables
    pub(crate) compaction_lock: Mutex<()>,
    pub(crate) options: Arc<StorageOptions>,
    pub(crate) compaction_controller: Box<dyn CompactionController>,
    path: PathBuf,
    manifest: Manifest,
    /// Shared by memtables and tables: a memtable flushes into the table with its id
    next_sst_id: AtomicUsize,
    /// Last sequence number handed out
    sequence: AtomicU64,
}

impl LsmStore {
    /// Open or create a store in `path`, replaying any logs left behind
    pub fn open(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let (manifest, persisted) = Manifest::open(&path)?;
        let fresh = persisted.is_none();
        let persisted = persisted.unwrap_or_default();

        let mut sstables = HashMap::new();
        for id in persisted
            .l0_sstables
            .iter()
            .chain(persisted.levels.iter().flatten())
        {
            let table = SsTable::open(*id, FileObject::open(&sst_path(&path, *id))?)?;
            sstables.insert(*id, Arc::new(table));
        }

        let mut levels = persisted.levels.clone();
        levels.resize(options.compaction.num_levels().max(levels.len()), Vec::new());
        for ids in &levels {
            let run: Vec<Arc<SsTable>> = ids
                .iter()
                .map(|id| {
                    sstables.get(id).cloned().ok_or_else(|| {
                        StrataError::Consistency(format!("SSTable {} not opened", id))
                    })
                })
                .collect::<Result<_>>()?;
            check_sorted_run(&run)?;
        }

        // tables written but never installed belong to an interrupted flush or
        // compaction; their data is still in a log or in the inputs
        let mut next_sst_id = persisted.next_sst_id;
        for entry in fs::read_dir(&path)? {
            let file = entry?.path();
            if let Some(id) = parse_sst_id(&file) {
                next_sst_id = next_sst_id.max(id + 1);
                if !sstables.contains_key(&id) {
                    warn!("Removing unreferenced SSTable {:?}", file);
                    fs::remove_file(&file)?;
                }
            }
        }

        let mut max_sequence = persisted.max_sequence;
        let mut imm_memtables = Vec::new();
        for (id, log) in WalReader::find_logs(&path)? {
            next_sst_id = next_sst_id.max(id + 1);
            if sstables.contains_key(&id) {
                // flushed before the crash, only the unlink was lost
                fs::remove_file(&log)?;
                continue;
            }
            let memtable = MemTable::recover_from_wal(id, &log, options.wal_sync_policy)?;
            max_sequence = max_sequence.max(memtable.max_sequence());
            imm_memtables.insert(0, Arc::new(memtable));
        }

        let memtable = Arc::new(Self::new_memtable(&path, &options, next_sst_id)?);
        let state = LsmState {
            memtable,
            imm_memtables,
            l0_sstables: persisted.l0_sstables,
            levels,
            sstables,
        };

        let store = Self {
            state: Arc::new(RwLock::new(Arc::new(state))),
            state_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            compaction_controller: options.compaction.controller(),
            options: Arc::new(options),
            path,
            manifest,
            next_sst_id: AtomicUsize::new(next_sst_id + 1),
            sequence: AtomicU64::new(max_sequence),
        };

        let recovered = store.state.read().imm_memtables.len();
        {
            let guard = store.state_lock.lock();
            while store.flush_next_imm_memtable(&guard)? {}
            if fresh && recovered == 0 {
                store.write_manifest(&store.state.read())?;
            }
        }

        info!(
            "Opened store at {:?}: {} SSTables, {} logs replayed, last sequence {}",
            store.path,
            store.state.read().num_sstables(),
            recovered,
            max_sequence
        );
        Ok(store)
    }

    fn new_memtable(dir: &Path, options: &StorageOptions, id: usize) -> Result<MemTable> {
        if options.enable_wal {
            MemTable::create_with_wal(id, wal_path(dir, id), options.wal_sync_policy)
        } else {
            Ok(MemTable::create(id))
        }
    }

    pub(crate) fn next_sst_id(&self) -> usize {
        self.next_sst_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Directory holding the tables and logs
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Persist the table layout of `state`; caller holds `state_lock`
    pub(crate) fn write_manifest(&self, state: &LsmState) -> Result<()> {
        self.manifest.write(&ManifestSnapshot {
            next_sst_id: self.next_sst_id.load(Ordering::SeqCst),
            max_sequence: self.sequence.load(Ordering::SeqCst),
            l0_sstables: state.l0_sstables.clone(),
            levels: state.levels.clone(),
        })
    }

    /// Insert or overwrite a key
    ///
    /// An `Err` means the write was not applied.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        if value.is_empty() {
            return Err(StrataError::InvalidArgument(
                "value must not be empty, use delete".into(),
            ));
        }
        self.write_entry(key, value)
    }

    /// Delete a key by writing a tombstone
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.write_entry(key, &[])
    }

    fn write_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let size = {
            // sequence order must match memtable order
            let state = self.state.write();
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            state.memtable.put(&Entry {
                key: Bytes::copy_from_slice(key),
                value: Bytes::copy_from_slice(value),
                sequence,
            })?;
            state.memtable.size()
        };
        // the entry is already visible; the next write retries the freeze
        if let Err(e) = self.try_freeze(size) {
            warn!("Failed to freeze memtable after write: {}", e);
        }
        Ok(())
    }

    fn try_freeze(&self, estimated_size: i64) -> Result<()> {
        let target = self.options.target_sst_size as i64;
        if estimated_size < target {
            return Ok(());
        }
        let guard = self.state_lock.lock();
        // another writer may have frozen it while we waited
        if self.state.read().memtable.size() >= target {
            self.force_freeze_memtable(&guard)?;
        }
        Ok(())
    }

    /// Freeze the active memtable if it holds anything
    pub fn force_freeze(&self) -> Result<()> {
        let guard = self.state_lock.lock();
        if self.state.read().memtable.is_empty() {
            return Ok(());
        }
        self.force_freeze_memtable(&guard)
    }

    /// Move the active memtable to the immutable queue and start a new one
    ///
    /// A full queue is drained from the oldest end first, so it never holds
    /// more than `max_memtable_count` memtables.
    pub(crate) fn force_freeze_memtable(&self, guard: &MutexGuard<'_, ()>) -> Result<()> {
        while self.state.read().imm_memtables.len() >= self.options.max_memtable_count {
            if !self.flush_next_imm_memtable(guard)? {
                break;
            }
        }

        let id = self.next_sst_id();
        let memtable = Arc::new(Self::new_memtable(&self.path, &self.options, id)?);
        let frozen = {
            let mut state = self.state.write();
            let mut snapshot = state.as_ref().clone();
            let frozen = std::mem::replace(&mut snapshot.memtable, memtable);
            snapshot.imm_memtables.insert(0, frozen.clone());
            *state = Arc::new(snapshot);
            frozen
        };
        frozen.sync_wal()?;

        debug!(
            "Froze memtable {} ({} bytes), active memtable is now {}",
            frozen.id(),
            frozen.size(),
            id
        );
        Ok(())
    }

    /// Write the oldest immutable memtable to a new L0 table
    ///
    /// Returns false if there was nothing to flush.
    pub(crate) fn flush_next_imm_memtable(&self, _guard: &MutexGuard<'_, ()>) -> Result<bool> {
        let Some(memtable) = self.state.read().imm_memtables.last().cloned() else {
            return Ok(false);
        };

        let table = if memtable.is_empty() {
            None
        } else {
            let mut builder = SsTableBuilder::with_bloom_fp_rate(
                self.options.block_size,
                self.options.bloom_false_positive_rate,
            );
            memtable.flush(&mut builder)?;
            Some(builder.build_shared(memtable.id(), sst_path(&self.path, memtable.id()))?)
        };

        let snapshot = {
            let mut state = self.state.write();
            let mut snapshot = state.as_ref().clone();
            let flushed = snapshot.imm_memtables.pop();
            debug_assert_eq!(flushed.map(|m| m.id()), Some(memtable.id()));
            if let Some(table) = &table {
                snapshot.l0_sstables.insert(0, table.id());
                snapshot.sstables.insert(table.id(), table.clone());
            }
            *state = Arc::new(snapshot);
            state.clone()
        };

        sync_dir(&self.path)?;
        self.write_manifest(&snapshot)?;
        if let Some(log) = memtable.wal_path() {
            match fs::remove_file(log) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }

        match table {
            Some(table) => info!(
                "Flushed memtable {} to SSTable ({} bytes, {} entries)",
                memtable.id(),
                table.table_size(),
                memtable.len()
            ),
            None => debug!("Dropped empty memtable {}", memtable.id()),
        }
        Ok(true)
    }

    /// True when the background flusher has work
    pub fn needs_flush(&self) -> bool {
        self.state.read().imm_memtables.len() >= self.options.max_memtable_count
    }

    /// Drain the immutable queue if it has reached its limit
    pub fn trigger_flush(&self) -> Result<()> {
        if !self.needs_flush() {
            return Ok(());
        }
        let guard = self.state_lock.lock();
        if self.state.read().imm_memtables.len() < self.options.max_memtable_count {
            return Ok(());
        }
        while self.flush_next_imm_memtable(&guard)? {}
        Ok(())
    }

    /// Freeze the active memtable and flush every memtable to L0
    pub fn force_flush(&self) -> Result<()> {
        let guard = self.state_lock.lock();
        if !self.state.read().memtable.is_empty() {
            self.force_freeze_memtable(&guard)?;
        }
        while self.flush_next_imm_memtable(&guard)? {}
        Ok(())
    }

    /// Point lookup; `None` if the key is absent or deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        validate_key(key)?;
        let snapshot = { self.state.read().clone() };

        let memtables = std::iter::once(&snapshot.memtable).chain(&snapshot.imm_memtables);
        for memtable in memtables {
            if let Some(entry) = memtable.get(key) {
                return Ok((!entry.is_tombstone()).then_some(entry.value));
            }
        }

        let may_hold = |table: &SsTable| {
            table.key_within(key) && (!self.options.enable_bloom_filter || table.may_contain(key))
        };

        let mut l0_iters = Vec::new();
        for id in &snapshot.l0_sstables {
            let table = snapshot.sstable(*id)?;
            if may_hold(table.as_ref()) {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_key(table, key)?));
            }
        }

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for ids in &snapshot.levels {
            let mut tables = Vec::new();
            for id in ids {
                let table = snapshot.sstable(*id)?;
                if may_hold(table.as_ref()) {
                    tables.push(table);
                }
            }
            level_iters.push(Box::new(LevelIterator::create_and_seek_to_key(tables, key)?));
        }

        let iter = TwoMergeIterator::create(
            MergeIterator::create(l0_iters),
            MergeIterator::create(level_iters),
        )?;
        if iter.is_valid() && iter.key() == key && !iter.value().is_empty() {
            return Ok(Some(Bytes::copy_from_slice(iter.value())));
        }
        Ok(None)
    }

    /// Live entries within the bounds, ascending
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<ScanIterator> {
        let snapshot = { self.state.read().clone() };

        let mut memtable_iters = Vec::with_capacity(snapshot.imm_memtables.len() + 1);
        memtable_iters.push(Box::new(snapshot.memtable.iter_range(lower, upper)));
        for memtable in &snapshot.imm_memtables {
            memtable_iters.push(Box::new(memtable.iter_range(lower, upper)));
        }

        let mut l0_iters = Vec::new();
        for id in &snapshot.l0_sstables {
            let table = snapshot.sstable(*id)?;
            if range_overlap(lower, upper, table.first_key(), table.last_key()) {
                l0_iters.push(Box::new(seek_table(table, lower)?));
            }
        }

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for ids in &snapshot.levels {
            let mut tables = Vec::new();
            for id in ids {
                let table = snapshot.sstable(*id)?;
                if range_overlap(lower, upper, table.first_key(), table.last_key()) {
                    tables.push(table);
                }
            }
            level_iters.push(Box::new(seek_level(tables, lower)?));
        }

        let inner = TwoMergeIterator::create(
            TwoMergeIterator::create(
                MergeIterator::create(memtable_iters),
                MergeIterator::create(l0_iters),
            )?,
            MergeIterator::create(level_iters),
        )?;
        ScanIterator::create(inner, upper)
    }

    /// Make everything written so far durable before shutdown
    pub fn close(&self) -> Result<()> {
        if self.options.enable_wal {
            self.state.read().memtable.sync_wal()?;
            return Ok(());
        }
        self.force_flush()
    }

    pub fn stats(&self) -> StorageStats {
        let snapshot = { self.state.read().clone() };
        StorageStats {
            memtable_id: snapshot.memtable.id(),
            memtable_size: snapshot.memtable.size(),
            imm_memtables: snapshot.imm_memtables.len(),
            l0_sstables: snapshot.l0_sstables.len(),
            level_sstables: snapshot.levels.iter().map(Vec::len).collect(),
            total_sst_bytes: snapshot.sstables.values().map(|t| t.table_size()).sum(),
            last_sequence: self.sequence.load(Ordering::SeqCst),
        }
    }

    /// Current version of the tree
    pub fn snapshot(&self) -> Arc<LsmState> {
        self.state.read().clone()
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(StrataError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StrataError::InvalidArgument(format!(
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

fn seek_table(table: Arc<SsTable>, lower: Bound<&[u8]>) -> Result<SsTableIterator> {
    match lower {
        Bound::Included(key) => SsTableIterator::create_and_seek_to_key(table, key),
        Bound::Excluded(key) => {
            let mut iter = SsTableIterator::create_and_seek_to_key(table, key)?;
            if iter.is_valid() && iter.key() == key {
                iter.next()?;
            }
            Ok(iter)
        }
        Bound::Unbounded => SsTableIterator::create_and_seek_to_first(table),
    }
}

fn seek_level(tables: Vec<Arc<SsTable>>, lower: Bound<&[u8]>) -> Result<LevelIterator> {
    match lower {
        Bound::Included(key) => LevelIterator::create_and_seek_to_key(tables, key),
        Bound::Excluded(key) => {
            let mut iter = LevelIterator::create_and_seek_to_key(tables, key)?;
            if iter.is_valid() && iter.key() == key {
                iter.next()?;
            }
            Ok(iter)
        }
        Bound::Unbounded => LevelIterator::create_and_seek_to_first(tables),
    }
}
