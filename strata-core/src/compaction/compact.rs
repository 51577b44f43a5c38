//! Running a compaction against the store

use super::CompactionTask;
use crate::iterator::{LevelIterator, MergeIterator, StorageIterator, TwoMergeIterator};
use crate::sstable::{sst_path, SsTable, SsTableBuilder, SsTableIterator};
use crate::storage::{LsmState, LsmStore};
use crate::{Result, StrataError};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl LsmStore {
    /// Merge all of L0 and L1 into a fresh L1
    pub fn force_full_compaction(&self) -> Result<()> {
        let _compaction = self.compaction_lock.lock();
        let snapshot = self.snapshot();
        let l1_sstables = snapshot.levels.first().cloned().unwrap_or_default();
        if snapshot.l0_sstables.is_empty() && l1_sstables.len() <= 1 {
            return Ok(());
        }
        let task = CompactionTask::Full {
            l0_sstables: snapshot.l0_sstables.clone(),
            l1_sstables,
        };
        self.run_compaction(task, &snapshot)
    }

    /// Run one compaction if the controller asks for it
    ///
    /// Returns true if a compaction ran.
    pub fn trigger_compaction(&self) -> Result<bool> {
        let _compaction = self.compaction_lock.lock();
        let snapshot = self.snapshot();
        let Some(task) = self.compaction_controller.generate_task(&snapshot) else {
            return Ok(false);
        };
        self.run_compaction(task, &snapshot)?;
        Ok(true)
    }

    fn run_compaction(&self, task: CompactionTask, snapshot: &LsmState) -> Result<()> {
        debug!("Running compaction: {:?}", task);
        let new_sstables = self.compact(&task, snapshot)?;
        let output: Vec<usize> = new_sstables.iter().map(|table| table.id()).collect();

        let removed = {
            let _state_lock = self.state_lock.lock();
            let mut current = self.snapshot().as_ref().clone();
            for table in &new_sstables {
                current.sstables.insert(table.id(), table.clone());
            }
            let (mut next, removed) =
                match self.compaction_controller.apply_result(&current, &task, &output) {
                    Ok(applied) => applied,
                    Err(e) => {
                        self.remove_tables(&output, "uninstalled");
                        return Err(e);
                    }
                };
            for id in &removed {
                next.sstables.remove(id);
            }
            let next = Arc::new(next);
            *self.state.write() = next.clone();

            crate::storage::sync_dir(self.path())?;
            self.write_manifest(&next)?;
            removed
        };

        self.remove_tables(&removed, "compacted");

        info!(
            "Compaction merged {} SSTables into {} ({:?})",
            removed.len(),
            output.len(),
            output
        );
        Ok(())
    }

    fn remove_tables(&self, ids: &[usize], what: &str) {
        for id in ids {
            let path = sst_path(self.path(), *id);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {} SSTable {:?}: {}", what, path, e);
            }
        }
    }

    /// Merge the inputs of `task` into new tables, not yet installed
    fn compact(&self, task: &CompactionTask, snapshot: &LsmState) -> Result<Vec<Arc<SsTable>>> {
        let drop_tombstones = task.compact_to_bottom_level(snapshot);
        match task {
            CompactionTask::Full {
                l0_sstables,
                l1_sstables,
            } => {
                let iter = TwoMergeIterator::create(
                    self.l0_merge(snapshot, l0_sstables)?,
                    LevelIterator::create_and_seek_to_first(snapshot.sstables_for(l1_sstables)?)?,
                )?;
                self.write_sorted_run(iter, drop_tombstones)
            }
            CompactionTask::Leveled(task) => {
                let lower = LevelIterator::create_and_seek_to_first(
                    snapshot.sstables_for(&task.lower_level_sst_ids)?,
                )?;
                match task.upper_level {
                    None => {
                        let upper = self.l0_merge(snapshot, &task.upper_level_sst_ids)?;
                        let iter = TwoMergeIterator::create(upper, lower)?;
                        self.write_sorted_run(iter, drop_tombstones)
                    }
                    Some(_) => {
                        let upper = LevelIterator::create_and_seek_to_first(
                            snapshot.sstables_for(&task.upper_level_sst_ids)?,
                        )?;
                        let iter = TwoMergeIterator::create(upper, lower)?;
                        self.write_sorted_run(iter, drop_tombstones)
                    }
                }
            }
        }
    }

    fn l0_merge(&self, snapshot: &LsmState, ids: &[usize]) -> Result<MergeIterator<SsTableIterator>> {
        let mut iters = Vec::with_capacity(ids.len());
        for table in snapshot.sstables_for(ids)? {
            iters.push(Box::new(SsTableIterator::create_and_seek_to_first(table)?));
        }
        Ok(MergeIterator::create(iters))
    }

    /// Cut the merged stream into tables of about `target_sst_size` bytes
    fn write_sorted_run<I: StorageIterator>(
        &self,
        mut iter: I,
        drop_tombstones: bool,
    ) -> Result<Vec<Arc<SsTable>>> {
        let options = self.options();
        let mut builder: Option<SsTableBuilder> = None;
        let mut output = Vec::new();

        while iter.is_valid() {
            if !(drop_tombstones && iter.value().is_empty()) {
                let current = builder.get_or_insert_with(|| {
                    SsTableBuilder::with_bloom_fp_rate(
                        options.block_size,
                        options.bloom_false_positive_rate,
                    )
                });
                current.add(iter.key(), iter.value());
                if current.estimated_size() >= options.target_sst_size {
                    if let Some(full) = builder.take() {
                        output.push(self.build_table(full)?);
                    }
                }
            }
            iter.next()?;
        }

        if let Some(last) = builder {
            if !last.is_empty() {
                output.push(self.build_table(last)?);
            }
        }
        Ok(output)
    }

    fn build_table(&self, builder: SsTableBuilder) -> Result<Arc<SsTable>> {
        let id = self.next_sst_id();
        builder
            .build_shared(id, sst_path(self.path(), id))
            .map_err(|e| StrataError::Compaction(format!("writing SSTable {}: {}", id, e)))
    }
}

#[cfg(test)]
mod tests {
    use crate::compaction::{CompactionPolicy, LeveledCompactionOptions};
    use crate::iterator::tests::collect;
    use crate::compaction::CompactionTask;
    use crate::storage::{LsmStore, StorageOptions};
    use crate::StrataError;
    use std::ops::Bound;
    use tempfile::TempDir;

    fn options(compaction: CompactionPolicy) -> StorageOptions {
        StorageOptions {
            block_size: 256,
            target_sst_size: 2048,
            compaction,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_compaction_drops_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let store = LsmStore::open(temp_dir.path(), options(CompactionPolicy::NoCompaction)).unwrap();

        for i in 0..100 {
            store.put(format!("key{:03}", i).as_bytes(), b"v1").unwrap();
        }
        store.force_flush().unwrap();
        for i in (0..100).step_by(2) {
            store.delete(format!("key{:03}", i).as_bytes()).unwrap();
        }
        store.put(b"key001", b"v2").unwrap();
        store.force_flush().unwrap();
        assert_eq!(store.snapshot().l0_sstables.len(), 2);

        store.force_full_compaction().unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.l0_sstables.is_empty());
        assert!(!snapshot.levels[0].is_empty());

        let mut iter = store.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
        let entries = collect(&mut iter);
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0], ("key001".to_string(), "v2".to_string()));

        // no tombstones survive in L1
        let mut raw = crate::iterator::LevelIterator::create_and_seek_to_first(
            snapshot.sstables_for(&snapshot.levels[0]).unwrap(),
        )
        .unwrap();
        assert!(collect(&mut raw).iter().all(|(_, v)| !v.is_empty()));

        // inputs are gone from disk
        let tables = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter(|e| {
                crate::sstable::parse_sst_id(&e.as_ref().unwrap().path()).is_some()
            })
            .count();
        assert_eq!(tables, snapshot.levels[0].len());
    }

    #[test]
    fn test_leveled_trigger() {
        let temp_dir = TempDir::new().unwrap();
        let store = LsmStore::open(
            temp_dir.path(),
            options(CompactionPolicy::Leveled(LeveledCompactionOptions {
                l0_file_compaction_trigger: 2,
                max_levels: 2,
            })),
        )
        .unwrap();

        store.put(b"a", b"1").unwrap();
        store.force_flush().unwrap();
        assert!(!store.trigger_compaction().unwrap());

        store.put(b"a", b"2").unwrap();
        store.put(b"b", b"2").unwrap();
        store.force_flush().unwrap();
        assert!(store.trigger_compaction().unwrap());

        let snapshot = store.snapshot();
        assert!(snapshot.l0_sstables.is_empty());
        assert_eq!(snapshot.levels[0].len(), 1);
        assert_eq!(store.get(b"a").unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(store.get(b"b").unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn test_compaction_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store =
                LsmStore::open(temp_dir.path(), options(CompactionPolicy::NoCompaction)).unwrap();
            for i in 0..300 {
                store
                    .put(format!("key{:04}", i).as_bytes(), format!("value{}", i).as_bytes())
                    .unwrap();
            }
            store.force_flush().unwrap();
            store.force_full_compaction().unwrap();
            assert!(store.snapshot().levels[0].len() > 1);
        }

        let store =
            LsmStore::open(temp_dir.path(), options(CompactionPolicy::NoCompaction)).unwrap();
        assert_eq!(
            store.get(b"key0123").unwrap().as_deref(),
            Some(&b"value123"[..])
        );
    }

    fn sst_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| crate::sstable::parse_sst_id(&e.as_ref().unwrap().path()).is_some())
            .count()
    }

    #[test]
    fn test_stale_task_leaves_no_output_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = LsmStore::open(temp_dir.path(), options(CompactionPolicy::NoCompaction)).unwrap();

        store.put(b"a", b"1").unwrap();
        store.force_flush().unwrap();
        store.force_full_compaction().unwrap();
        store.put(b"b", b"2").unwrap();
        store.force_flush().unwrap();

        let stale = store.snapshot();
        let task = CompactionTask::Full {
            l0_sstables: stale.l0_sstables.clone(),
            l1_sstables: stale.levels[0].clone(),
        };
        // L1 moves on before the task installs
        store.put(b"c", b"3").unwrap();
        store.force_flush().unwrap();
        store.force_full_compaction().unwrap();

        let err = store.run_compaction(task, &stale).unwrap_err();
        assert!(matches!(err, StrataError::Consistency(_)));

        let current = store.snapshot();
        assert_eq!(sst_files(temp_dir.path()), current.num_sstables());
        assert_eq!(store.get(b"b").unwrap().as_deref(), Some(&b"2"[..]));
    }
}
