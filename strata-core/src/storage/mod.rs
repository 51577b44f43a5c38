//! Storage engine - coordinates all storage components
//!
//! [`LsmStore`] holds the tree and implements reads, writes, freezing and
//! flushing. [`Storage`] wraps it with the background flush and compaction
//! threads and is the handle applications use.

mod engine;
mod manifest;
mod scan;
mod state;
mod store;

pub use engine::Storage;
pub use manifest::{Manifest, ManifestSnapshot};
pub use scan::ScanIterator;
pub use state::LsmState;
pub use store::LsmStore;

use crate::compaction::CompactionPolicy;
use crate::wal::SyncPolicy;
use crate::{Result, StrataError};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Log writes to a WAL before applying them
    pub enable_wal: bool,
    /// Consult Bloom filters on point lookups
    pub enable_bloom_filter: bool,
    /// Frozen memtables kept in memory before flushing is forced
    pub max_memtable_count: usize,
    /// SSTable block size in bytes
    pub block_size: usize,
    /// Memtable size that triggers a freeze; also the compaction output size
    pub target_sst_size: usize,
    /// Compaction policy
    pub compaction: CompactionPolicy,
    /// Bloom filter false positive rate
    pub bloom_false_positive_rate: f64,
    /// Background flush tick
    pub flush_interval: Duration,
    /// WAL fsync policy
    pub wal_sync_policy: SyncPolicy,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            enable_wal: true,
            enable_bloom_filter: true,
            max_memtable_count: crate::config::MAX_MEMTABLE_COUNT,
            block_size: crate::config::BLOCK_SIZE,
            target_sst_size: crate::config::TARGET_SST_SIZE,
            compaction: CompactionPolicy::NoCompaction,
            bloom_false_positive_rate: crate::config::BLOOM_FP_RATE,
            flush_interval: Duration::from_millis(crate::config::FLUSH_INTERVAL_MS),
            wal_sync_policy: SyncPolicy::default(),
        }
    }
}

impl StorageOptions {
    /// Reject settings the on-disk format or the flush logic cannot honor
    pub fn validate(&self) -> Result<()> {
        // offsets inside a block are u16
        if self.block_size < 64 || self.block_size > u16::MAX as usize {
            return Err(StrataError::Config(format!(
                "block_size must be within 64..=65535, got {}",
                self.block_size
            )));
        }
        // table offsets are u32
        if self.target_sst_size == 0 || self.target_sst_size > u32::MAX as usize {
            return Err(StrataError::Config(format!(
                "target_sst_size must be within 1..={}, got {}",
                u32::MAX,
                self.target_sst_size
            )));
        }
        if self.max_memtable_count == 0 {
            return Err(StrataError::Config("max_memtable_count must be positive".into()));
        }
        let rate = self.bloom_false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(StrataError::Config(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                rate
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(StrataError::Config("flush_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Point-in-time view of the tree shape
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub memtable_id: usize,
    pub memtable_size: i64,
    pub imm_memtables: usize,
    pub l0_sstables: usize,
    /// Table count per sorted level, L1 first
    pub level_sstables: Vec<usize>,
    pub total_sst_bytes: u64,
    pub last_sequence: u64,
}

/// fsync a directory so renames and new files inside it survive a crash
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}
