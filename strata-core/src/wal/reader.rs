//! WAL reader for recovery

use super::{decode_record, parse_wal_id, DecodedRecord};
use crate::{Entry, Result, StrataError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reads log files back after a restart
pub struct WalReader;

impl WalReader {
    /// Read every intact record from one log file
    ///
    /// A torn or corrupted tail (crash during append) ends the log: the
    /// records before it are returned and the rest is ignored.
    pub fn read(path: &Path) -> Result<Vec<Entry>> {
        let data = fs::read(path)?;
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Ok(DecodedRecord::Record(entry, bytes_read)) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Ok(DecodedRecord::Incomplete) => {
                    warn!(
                        "Incomplete record at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(e) if e.is_corruption() => {
                    warn!(
                        "Corrupted record at offset {} in {:?}, truncating: {}",
                        offset, path, e
                    );
                    break;
                }
                Err(StrataError::Serialization(msg)) => {
                    return Err(StrataError::WalRecovery(format!(
                        "{:?} at offset {}: {}",
                        path, offset, msg
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        info!("Recovered {} entries from {:?}", entries.len(), path);
        Ok(entries)
    }

    /// All log files in `dir`, ordered by memtable id
    pub fn find_logs(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
        let mut logs = Vec::new();
        if !dir.exists() {
            return Ok(logs);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = parse_wal_id(&path) {
                logs.push((id, path));
            }
        }
        logs.sort_by_key(|(id, _)| *id);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{encode_record, wal_path, SyncPolicy, Wal, WriteAheadLog};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_log(dir: &Path, id: usize, count: u64) -> PathBuf {
        let path = wal_path(dir, id);
        let wal = Wal::create(&path, SyncPolicy::Immediate).unwrap();
        for i in 0..count {
            wal.append(&Entry::put(format!("key{}", i), format!("value{}", i), i + 1))
                .unwrap();
        }
        path
    }

    #[test]
    fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_log(temp_dir.path(), 1, 10);

        let entries = WalReader::read(&path).unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[9].key.as_ref(), b"key9");
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_log(temp_dir.path(), 1, 4);

        // half of a fifth record
        let partial = encode_record(&Entry::put("key4", "value4", 5)).unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);
        assert_eq!(WalReader::read(&path).unwrap().len(), 4);

        // flip a byte inside the third record
        let mut raw = fs::read(&path).unwrap();
        let record_len = encode_record(&Entry::put("key0", "value0", 1)).unwrap().len();
        raw[record_len * 2 + 8] ^= 0xFF;
        fs::write(&path, &raw).unwrap();
        assert_eq!(WalReader::read(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_find_logs_sorted() {
        let temp_dir = TempDir::new().unwrap();
        write_log(temp_dir.path(), 12, 1);
        write_log(temp_dir.path(), 3, 1);
        fs::write(temp_dir.path().join("3.sst"), b"not a log").unwrap();

        let logs = WalReader::find_logs(temp_dir.path()).unwrap();
        let ids: Vec<usize> = logs.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 12]);
    }
}
