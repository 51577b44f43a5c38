//! Strata Core - Embedded LSM-Tree Key-Value Storage Engine
//!
//! Writes land in an in-memory sorted buffer, get frozen once it grows past
//! the target table size, and are flushed by a background thread into
//! immutable sorted tables on disk. Reads merge every generation with
//! newest-wins semantics; an empty value is a tombstone.
//!
//! # Architecture
//!
//! - **WAL (Write-Ahead Log)**: one log per memtable, replayed on open
//! - **MemTable**: lock-free skip map holding the latest write per key
//! - **SSTable**: checksummed blocks, a block index and a Bloom filter
//! - **Iterators**: block, table, level, k-way merge and two-way merge
//! - **Compaction**: merges level 0 into the first sorted level

pub mod compaction;
pub mod iterator;
pub mod memtable;
pub mod sstable;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{Result, StrataError};
pub use storage::{Storage, StorageOptions, StorageStats};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// SSTable block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Memtable size that triggers a freeze, also the target SSTable size (2MB)
    pub const TARGET_SST_SIZE: usize = 2 * 1024 * 1024;

    /// Immutable memtables kept in memory before a flush is forced
    pub const MAX_MEMTABLE_COUNT: usize = 2;

    /// Bloom filter false positive rate
    pub const BLOOM_FP_RATE: f64 = 0.01;

    /// Background flush tick
    pub const FLUSH_INTERVAL_MS: u64 = 100;

    /// Maximum SSTables in L0 before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Number of sorted levels below L0
    pub const MAX_LEVELS: usize = 4;
}
