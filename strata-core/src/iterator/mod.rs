//! Iterators shared by every storage layer
//!
//! All sources (memtables, blocks, tables, levels) expose the same cursor
//! interface so they can be composed: a k-way [`MergeIterator`] collapses
//! sources of one kind, and a [`TwoMergeIterator`] layers a newer source over
//! an older one of a different kind.

mod level;
mod merge;
mod two_merge;

pub use level::{check_sorted_run, LevelIterator};
pub use merge::MergeIterator;
pub use two_merge::TwoMergeIterator;

use crate::Result;

/// Ordered key/value cursor
///
/// `key` and `value` may only be called while `is_valid` returns true.
pub trait StorageIterator {
    /// Current key
    fn key(&self) -> &[u8];

    /// Current value; empty means tombstone
    fn value(&self) -> &[u8];

    /// True while positioned on an entry
    fn is_valid(&self) -> bool;

    /// Advance to the next entry
    fn next(&mut self) -> Result<()>;

    /// Number of underlying iterators still producing entries
    fn num_active_iterators(&self) -> usize {
        1
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;

    /// In-memory iterator for exercising merge logic
    pub struct VecIterator {
        entries: Vec<(Bytes, Bytes)>,
        pos: usize,
        fail_at: Option<usize>,
    }

    impl VecIterator {
        pub fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                entries: entries
                    .iter()
                    .map(|(k, v)| {
                        (
                            Bytes::copy_from_slice(k.as_bytes()),
                            Bytes::copy_from_slice(v.as_bytes()),
                        )
                    })
                    .collect(),
                pos: 0,
                fail_at: None,
            }
        }

        /// Return an error when advancing away from position `pos`
        pub fn failing_at(mut self, pos: usize) -> Self {
            self.fail_at = Some(pos);
            self
        }
    }

    impl StorageIterator for VecIterator {
        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }

        fn is_valid(&self) -> bool {
            self.pos < self.entries.len()
        }

        fn next(&mut self) -> Result<()> {
            if self.fail_at == Some(self.pos) {
                return Err(crate::StrataError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected failure",
                )));
            }
            self.pos += 1;
            Ok(())
        }
    }

    /// Drain an iterator into owned `(key, value)` strings
    pub fn collect<I: StorageIterator>(iter: &mut I) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while iter.is_valid() {
            out.push((
                String::from_utf8_lossy(iter.key()).into_owned(),
                String::from_utf8_lossy(iter.value()).into_owned(),
            ));
            iter.next().unwrap();
        }
        out
    }
}
