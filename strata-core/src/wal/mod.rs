//! Write-Ahead Log (WAL) implementation
//!
//! Every memtable that has a WAL owns one log file, `<id>.wal`, next to the
//! SSTables. Writes are appended to the log before they reach the memtable,
//! and the file is deleted once the memtable has been flushed. On open, any
//! log still on disk is replayed to rebuild the memtables it belonged to.

mod entry;
mod reader;
mod writer;

pub use entry::{decode_record, encode_record, DecodedRecord, WalEntryType, WalRecord};
pub use reader::WalReader;
pub use writer::Wal;

use crate::{Entry, Result};
use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// Durable log consulted for crash recovery
pub trait WriteAheadLog: Send + Sync {
    /// Record a write before it is applied
    fn append(&self, entry: &Entry) -> Result<()>;

    /// Force buffered records to disk
    fn sync(&self) -> Result<()>;

    /// Every intact record, in append order
    fn replay(&self) -> Result<Vec<Entry>>;
}

/// File name of the log owned by memtable `id`
pub fn wal_path(dir: &Path, id: usize) -> PathBuf {
    dir.join(format!("{}.wal", id))
}

/// Parse a memtable id back out of a file name produced by [`wal_path`]
pub fn parse_wal_id(path: &Path) -> Option<usize> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_suffix(".wal"))
        .and_then(|s| s.parse().ok())
}
