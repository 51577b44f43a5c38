//! File-backed WAL

use super::{encode_record, SyncPolicy, WalReader, WriteAheadLog};
use crate::{Entry, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Append-only log file for one memtable
pub struct Wal {
    path: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: BufWriter<File>,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl Wal {
    /// Create a new, empty log at `path`
    pub fn create(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(path.as_ref(), file, sync_policy))
    }

    /// Open an existing log for further appends
    pub fn open(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path.as_ref())?;
        Ok(Self::from_file(path.as_ref(), file, sync_policy))
    }

    fn from_file(path: &Path, file: File, sync_policy: SyncPolicy) -> Self {
        Self {
            path: path.to_path_buf(),
            sync_policy,
            inner: Mutex::new(WalInner {
                file: BufWriter::new(file),
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
        }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn should_sync(&self, inner: &WalInner) -> bool {
        match self.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn sync_inner(inner: &mut WalInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }
}

impl WriteAheadLog for Wal {
    fn append(&self, entry: &Entry) -> Result<()> {
        let serialized = encode_record(entry)?;
        let mut inner = self.inner.lock();

        inner.file.write_all(&serialized)?;
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else if self.sync_policy != SyncPolicy::None {
            // hand the record to the OS even when the fsync is deferred
            inner.file.flush()?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    fn replay(&self) -> Result<Vec<Entry>> {
        self.inner.lock().file.flush()?;
        WalReader::read(&self.path)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::wal_path;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = wal_path(temp_dir.path(), 3);

        let wal = Wal::create(&path, SyncPolicy::Immediate).unwrap();
        wal.append(&Entry::put("a", "1", 1)).unwrap();
        wal.append(&Entry::put("b", "2", 2)).unwrap();
        wal.append(&Entry::tombstone("a", 3)).unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], Entry::put("a", "1", 1));
        assert!(entries[2].is_tombstone());

        // create refuses to clobber an existing log
        assert!(Wal::create(&path, SyncPolicy::Immediate).is_err());
    }

    #[test]
    fn test_reopen_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = wal_path(temp_dir.path(), 1);

        {
            let wal = Wal::create(&path, SyncPolicy::EveryN(10)).unwrap();
            for i in 0..5u64 {
                wal.append(&Entry::put(format!("k{}", i), "v", i)).unwrap();
            }
            wal.sync().unwrap();
        }

        let wal = Wal::open(&path, SyncPolicy::None).unwrap();
        wal.append(&Entry::put("k5", "v", 5)).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[5].sequence, 5);
    }
}
