//! Compaction for the LSM tree
//!
//! A [`CompactionController`] decides *which* tables to merge; the merge
//! itself (in `compact.rs`) is the same for every policy: stream the chosen
//! tables through the merge iterators, write fresh SSTables, then swap the
//! table sets in one step.

mod compact;
mod leveled;

pub use leveled::{LeveledCompactionController, LeveledCompactionOptions};

use crate::storage::LsmState;
use crate::{Result, StrataError};
use std::collections::HashSet;

/// Compaction task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionTask {
    /// Merge every listed L0 table with the whole of L1 into a new L1
    Full {
        l0_sstables: Vec<usize>,
        l1_sstables: Vec<usize>,
    },
    /// Merge part of one level into the next
    Leveled(LeveledCompactionTask),
}

/// Tables picked by a leveled policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeveledCompactionTask {
    /// `None` for L0, otherwise the sorted level number (1-based)
    pub upper_level: Option<usize>,
    pub upper_level_sst_ids: Vec<usize>,
    /// Sorted level number (1-based)
    pub lower_level: usize,
    pub lower_level_sst_ids: Vec<usize>,
    pub is_lower_level_bottom: bool,
}

impl CompactionTask {
    /// True if no deeper level can hold an older version of any key
    pub fn compact_to_bottom_level(&self, state: &LsmState) -> bool {
        match self {
            CompactionTask::Full { .. } => state.levels.iter().skip(1).all(|l| l.is_empty()),
            CompactionTask::Leveled(task) => task.is_lower_level_bottom,
        }
    }
}

/// Policy for choosing tables to merge
pub trait CompactionController: Send + Sync {
    /// Pick the next compaction, if any is due
    fn generate_task(&self, state: &LsmState) -> Option<CompactionTask>;

    /// Install the output of `task` into a copy of `state`
    ///
    /// `output` tables must already be registered in `state.sstables`.
    /// Returns the new state and the ids the caller should unregister and
    /// delete.
    fn apply_result(
        &self,
        state: &LsmState,
        task: &CompactionTask,
        output: &[usize],
    ) -> Result<(LsmState, Vec<usize>)>;
}

/// Compaction policy selected in the storage options
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompactionPolicy {
    /// Only on-demand full compaction
    #[default]
    NoCompaction,
    /// Background L0 -> L1 compaction driven by the L0 table count
    Leveled(LeveledCompactionOptions),
}

impl CompactionPolicy {
    /// Number of sorted levels below L0
    pub fn num_levels(&self) -> usize {
        match self {
            CompactionPolicy::NoCompaction => 1,
            CompactionPolicy::Leveled(options) => options.max_levels.max(1),
        }
    }

    /// Build the controller for this policy
    pub fn controller(&self) -> Box<dyn CompactionController> {
        match self {
            CompactionPolicy::NoCompaction => Box::new(NoCompactionController),
            CompactionPolicy::Leveled(options) => {
                Box::new(LeveledCompactionController::new(options.clone()))
            }
        }
    }

    /// True if a background thread has work to do
    pub fn runs_in_background(&self) -> bool {
        !matches!(self, CompactionPolicy::NoCompaction)
    }
}

/// Never schedules work; full compaction can still be forced
pub struct NoCompactionController;

impl CompactionController for NoCompactionController {
    fn generate_task(&self, _state: &LsmState) -> Option<CompactionTask> {
        None
    }

    fn apply_result(
        &self,
        state: &LsmState,
        task: &CompactionTask,
        output: &[usize],
    ) -> Result<(LsmState, Vec<usize>)> {
        match task {
            CompactionTask::Full {
                l0_sstables,
                l1_sstables,
            } => apply_full_compaction(state, l0_sstables, l1_sstables, output),
            CompactionTask::Leveled(_) => Err(StrataError::Compaction(
                "leveled task given to a store without a compaction policy".into(),
            )),
        }
    }
}

/// Replace the compacted L0 tables and all of L1 with `output`
///
/// L0 tables flushed after the task was generated stay in place.
pub(crate) fn apply_full_compaction(
    state: &LsmState,
    l0_sstables: &[usize],
    l1_sstables: &[usize],
    output: &[usize],
) -> Result<(LsmState, Vec<usize>)> {
    let mut snapshot = state.clone();
    let level = snapshot
        .levels
        .first_mut()
        .ok_or_else(|| StrataError::Consistency("store has no sorted level".into()))?;
    if level.as_slice() != l1_sstables {
        return Err(StrataError::Consistency(
            "L1 changed while a full compaction was running".into(),
        ));
    }
    *level = output.to_vec();

    let compacted: HashSet<usize> = l0_sstables.iter().copied().collect();
    snapshot.l0_sstables.retain(|id| !compacted.contains(id));

    let removed = l0_sstables.iter().chain(l1_sstables).copied().collect();
    Ok((snapshot, removed))
}
