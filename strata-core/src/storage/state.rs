//! Snapshot of the LSM tree structure

use crate::memtable::MemTable;
use crate::sstable::SsTable;
use crate::{Result, StrataError};
use std::collections::HashMap;
use std::sync::Arc;

/// One version of the tree
///
/// Readers clone the `Arc<LsmState>` and work on that copy; writers build a
/// modified clone and swap it in, so a snapshot never changes under a reader.
#[derive(Clone)]
pub struct LsmState {
    /// Memtable receiving writes
    pub memtable: Arc<MemTable>,
    /// Frozen memtables, newest first
    pub imm_memtables: Vec<Arc<MemTable>>,
    /// L0 table ids, newest first; ranges may overlap
    pub l0_sstables: Vec<usize>,
    /// Sorted levels from L1 down; each is a non-overlapping run ordered by key
    pub levels: Vec<Vec<usize>>,
    /// Every live table by id
    pub sstables: HashMap<usize, Arc<SsTable>>,
}

impl LsmState {
    pub fn create(memtable: Arc<MemTable>, num_levels: usize) -> Self {
        Self {
            memtable,
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels: vec![Vec::new(); num_levels.max(1)],
            sstables: HashMap::new(),
        }
    }

    /// Look up a table that the structure refers to
    pub fn sstable(&self, id: usize) -> Result<Arc<SsTable>> {
        self.sstables
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::Consistency(format!("SSTable {} missing from registry", id)))
    }

    /// Tables for a list of ids, in the same order
    pub fn sstables_for(&self, ids: &[usize]) -> Result<Vec<Arc<SsTable>>> {
        ids.iter().map(|id| self.sstable(*id)).collect()
    }

    /// Number of tables across L0 and the sorted levels
    pub fn num_sstables(&self) -> usize {
        self.l0_sstables.len() + self.levels.iter().map(Vec::len).sum::<usize>()
    }
}

impl std::fmt::Debug for LsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmState")
            .field("memtable", &self.memtable.id())
            .field(
                "imm_memtables",
                &self.imm_memtables.iter().map(|m| m.id()).collect::<Vec<_>>(),
            )
            .field("l0_sstables", &self.l0_sstables)
            .field("levels", &self.levels)
            .finish()
    }
}
