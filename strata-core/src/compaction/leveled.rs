//! L0-triggered leveled compaction
//!
//! Only the L0 -> L1 step is scheduled: once L0 holds enough tables, all of
//! them are merged with the L1 tables whose key range they overlap. Deeper
//! levels are never chosen as compaction sources.

use super::{
    apply_full_compaction, CompactionController, CompactionTask, LeveledCompactionTask,
};
use crate::storage::LsmState;
use crate::{Result, StrataError};
use bytes::Bytes;
use std::collections::HashSet;

/// Leveled compaction configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeveledCompactionOptions {
    /// L0 table count that triggers a compaction
    pub l0_file_compaction_trigger: usize,
    /// Number of sorted levels below L0
    pub max_levels: usize,
}

impl Default for LeveledCompactionOptions {
    fn default() -> Self {
        Self {
            l0_file_compaction_trigger: crate::config::L0_COMPACTION_TRIGGER,
            max_levels: crate::config::MAX_LEVELS,
        }
    }
}

pub struct LeveledCompactionController {
    options: LeveledCompactionOptions,
}

impl LeveledCompactionController {
    pub fn new(options: LeveledCompactionOptions) -> Self {
        Self { options }
    }

    /// Ids in sorted level `level` (1-based) overlapping the key span of `sst_ids`
    pub fn overlapping_sst_ids(state: &LsmState, sst_ids: &[usize], level: usize) -> Vec<usize> {
        let Some((first, last)) = key_span(state, sst_ids) else {
            return Vec::new();
        };
        let Some(ids) = state.levels.get(level.wrapping_sub(1)) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| {
                state
                    .sstables
                    .get(id)
                    .map(|table| table.range_overlap(&first, &last))
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }
}

/// Smallest first key and largest last key among `sst_ids`
fn key_span(state: &LsmState, sst_ids: &[usize]) -> Option<(Bytes, Bytes)> {
    let mut span: Option<(Bytes, Bytes)> = None;
    for table in sst_ids.iter().filter_map(|id| state.sstables.get(id)) {
        span = Some(match span {
            None => (table.first_key().clone(), table.last_key().clone()),
            Some((first, last)) => (
                first.min(table.first_key().clone()),
                last.max(table.last_key().clone()),
            ),
        });
    }
    span
}

impl CompactionController for LeveledCompactionController {
    fn generate_task(&self, state: &LsmState) -> Option<CompactionTask> {
        if state.l0_sstables.is_empty()
            || state.l0_sstables.len() < self.options.l0_file_compaction_trigger
        {
            return None;
        }

        let upper = state.l0_sstables.clone();
        let lower = Self::overlapping_sst_ids(state, &upper, 1);
        let is_lower_level_bottom = state.levels.iter().skip(1).all(|level| level.is_empty());

        Some(CompactionTask::Leveled(LeveledCompactionTask {
            upper_level: None,
            upper_level_sst_ids: upper,
            lower_level: 1,
            lower_level_sst_ids: lower,
            is_lower_level_bottom,
        }))
    }

    fn apply_result(
        &self,
        state: &LsmState,
        task: &CompactionTask,
        output: &[usize],
    ) -> Result<(LsmState, Vec<usize>)> {
        let task = match task {
            CompactionTask::Full {
                l0_sstables,
                l1_sstables,
            } => return apply_full_compaction(state, l0_sstables, l1_sstables, output),
            CompactionTask::Leveled(task) => task,
        };

        let mut snapshot = state.clone();
        let upper: HashSet<usize> = task.upper_level_sst_ids.iter().copied().collect();
        match task.upper_level {
            None => snapshot.l0_sstables.retain(|id| !upper.contains(id)),
            Some(level) => level_mut(&mut snapshot, level)?.retain(|id| !upper.contains(id)),
        }

        let lower: HashSet<usize> = task.lower_level_sst_ids.iter().copied().collect();
        let mut ids = std::mem::take(level_mut(&mut snapshot, task.lower_level)?);
        let before = ids.len();
        ids.retain(|id| !lower.contains(id));
        if before - ids.len() != lower.len() {
            return Err(StrataError::Consistency(format!(
                "L{} lost tables while being compacted",
                task.lower_level
            )));
        }
        ids.extend_from_slice(output);

        let mut keyed = Vec::with_capacity(ids.len());
        for id in ids {
            let table = snapshot.sstables.get(&id).ok_or_else(|| {
                StrataError::Consistency(format!("SSTable {} missing from registry", id))
            })?;
            keyed.push((table.first_key().clone(), id));
        }
        keyed.sort();
        *level_mut(&mut snapshot, task.lower_level)? = keyed.into_iter().map(|(_, id)| id).collect();

        Ok((snapshot, task_ids(task)))
    }
}

fn level_mut(state: &mut LsmState, level: usize) -> Result<&mut Vec<usize>> {
    state
        .levels
        .get_mut(level.wrapping_sub(1))
        .ok_or_else(|| StrataError::Consistency(format!("no level L{}", level)))
}

fn task_ids(task: &LeveledCompactionTask) -> Vec<usize> {
    task.upper_level_sst_ids
        .iter()
        .chain(&task.lower_level_sst_ids)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::sstable::{SsTable, SsTableBuilder};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn table(dir: &TempDir, id: usize, first: &str, last: &str) -> Arc<SsTable> {
        let mut builder = SsTableBuilder::new(4096);
        builder.add(first.as_bytes(), b"v");
        if first != last {
            builder.add(last.as_bytes(), b"v");
        }
        builder
            .build_shared(id, dir.path().join(format!("{}.sst", id)))
            .unwrap()
    }

    fn controller(trigger: usize) -> LeveledCompactionController {
        LeveledCompactionController::new(LeveledCompactionOptions {
            l0_file_compaction_trigger: trigger,
            max_levels: 3,
        })
    }

    #[test]
    fn test_trigger_and_overlap_selection() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = LsmState::create(Arc::new(MemTable::create(100)), 3);
        for (id, first, last) in [
            (1, "a", "c"),
            (2, "d", "f"),
            (3, "g", "i"),
            (10, "b", "d"),
            (11, "e", "e"),
        ] {
            state.sstables.insert(id, table(&temp_dir, id, first, last));
        }
        state.levels[0] = vec![1, 2, 3];
        state.l0_sstables = vec![11];

        assert!(controller(2).generate_task(&state).is_none());

        state.l0_sstables = vec![11, 10];
        let task = controller(2).generate_task(&state).unwrap();
        let CompactionTask::Leveled(leveled) = &task else {
            panic!("expected a leveled task");
        };
        assert_eq!(leveled.upper_level, None);
        assert_eq!(leveled.upper_level_sst_ids, vec![11, 10]);
        // span b..e touches tables 1 and 2 only
        assert_eq!(leveled.lower_level_sst_ids, vec![1, 2]);
        assert!(leveled.is_lower_level_bottom);
    }

    #[test]
    fn test_apply_keeps_level_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = LsmState::create(Arc::new(MemTable::create(100)), 3);
        for (id, first, last) in [
            (1, "a", "c"),
            (2, "d", "f"),
            (3, "x", "z"),
            (10, "b", "e"),
            (20, "a", "b"),
            (21, "c", "f"),
        ] {
            state.sstables.insert(id, table(&temp_dir, id, first, last));
        }
        state.levels[0] = vec![1, 2, 3];
        state.l0_sstables = vec![10];

        let task = CompactionTask::Leveled(LeveledCompactionTask {
            upper_level: None,
            upper_level_sst_ids: vec![10],
            lower_level: 1,
            lower_level_sst_ids: vec![1, 2],
            is_lower_level_bottom: true,
        });
        let (next, removed) = controller(1).apply_result(&state, &task, &[21, 20]).unwrap();
        assert!(next.l0_sstables.is_empty());
        assert_eq!(next.levels[0], vec![20, 21, 3]);
        assert_eq!(removed, vec![10, 1, 2]);
    }
}
