//! SSTable reader

use super::{hash_key, Block, BlockMeta, BloomFilter, FileObject, SIZEOF_U32};
use crate::{Result, StrataError};
use bytes::{Buf, Bytes};
use std::sync::Arc;

/// An opened, immutable table file
pub struct SsTable {
    id: usize,
    file: FileObject,
    block_meta: Vec<BlockMeta>,
    block_meta_offset: usize,
    bloom: BloomFilter,
    first_key: Bytes,
    last_key: Bytes,
}

impl SsTable {
    /// Open a table from its file, loading the block index and Bloom filter
    pub fn open(id: usize, file: FileObject) -> Result<Self> {
        let len = file.size();
        if len < SIZEOF_U32 as u64 {
            return Err(StrataError::Corruption(format!(
                "SSTable {} too short: {} bytes",
                id, len
            )));
        }

        let footer = file.read(len - SIZEOF_U32 as u64, SIZEOF_U32)?;
        let block_meta_offset = (&footer[..]).get_u32() as usize;
        let meta_end = len as usize - SIZEOF_U32;
        if block_meta_offset > meta_end {
            return Err(StrataError::Corruption(format!(
                "SSTable {} meta offset {} beyond {}",
                id, block_meta_offset, meta_end
            )));
        }

        let section = file.read(block_meta_offset as u64, meta_end - block_meta_offset)?;
        let (block_meta, consumed) = BlockMeta::decode_block_meta(&section)?;
        let bloom = BloomFilter::decode(&section[consumed..])?;

        let (first_key, last_key) = match (block_meta.first(), block_meta.last()) {
            (Some(first), Some(last)) => (first.first_key.clone(), last.last_key.clone()),
            _ => {
                return Err(StrataError::Corruption(format!(
                    "SSTable {} has no blocks",
                    id
                )))
            }
        };

        let mut prev_end = 0;
        for meta in &block_meta {
            if meta.offset < prev_end || meta.offset >= block_meta_offset {
                return Err(StrataError::Corruption(format!(
                    "SSTable {} block offset {} out of order",
                    id, meta.offset
                )));
            }
            prev_end = meta.offset + SIZEOF_U32;
        }

        Ok(Self {
            id,
            file,
            block_meta,
            block_meta_offset,
            bloom,
            first_key,
            last_key,
        })
    }

    /// Read block `idx` from disk and verify its checksum
    pub fn read_block(&self, idx: usize) -> Result<Arc<Block>> {
        let meta = self.block_meta.get(idx).ok_or_else(|| {
            StrataError::Internal(format!("block {} out of range in SSTable {}", idx, self.id))
        })?;
        let start = meta.offset;
        let end = self
            .block_meta
            .get(idx + 1)
            .map(|m| m.offset)
            .unwrap_or(self.block_meta_offset);
        if end < start + SIZEOF_U32 {
            return Err(StrataError::Corruption(format!(
                "block {} of SSTable {} is shorter than its checksum",
                idx, self.id
            )));
        }

        let raw = self.file.read(start as u64, end - start)?;
        let (block_data, mut checksum) = raw.split_at(raw.len() - SIZEOF_U32);
        let expected = checksum.get_u32();
        let actual = crc32fast::hash(block_data);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        Ok(Arc::new(Block::decode(block_data)?))
    }

    /// Index of the block that may contain `key`
    ///
    /// The greatest block whose first key is `<= key`, or 0.
    pub fn find_block_idx(&self, key: &[u8]) -> usize {
        self.block_meta
            .partition_point(|meta| meta.first_key.as_ref() <= key)
            .saturating_sub(1)
    }

    /// True if `key` falls inside the table's key range
    pub fn key_within(&self, key: &[u8]) -> bool {
        self.first_key.as_ref() <= key && key <= self.last_key.as_ref()
    }

    /// Bloom filter check
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.may_contain(hash_key(key))
    }

    /// True if `[start, end]` intersects the table's key range
    pub fn range_overlap(&self, start: &[u8], end: &[u8]) -> bool {
        start <= self.last_key.as_ref() && self.first_key.as_ref() <= end
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_blocks(&self) -> usize {
        self.block_meta.len()
    }

    pub fn block_meta(&self) -> &[BlockMeta] {
        &self.block_meta
    }

    pub fn first_key(&self) -> &Bytes {
        &self.first_key
    }

    pub fn last_key(&self) -> &Bytes {
        &self.last_key
    }

    /// File size in bytes
    pub fn table_size(&self) -> u64 {
        self.file.size()
    }

    /// Backing file path
    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("blocks", &self.block_meta.len())
            .field("first_key", &self.first_key)
            .field("last_key", &self.last_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{BlockIterator, SsTableBuilder};
    use tempfile::TempDir;

    fn build_table(dir: &TempDir, id: usize, count: usize) -> SsTable {
        let mut builder = SsTableBuilder::new(256);
        for i in 0..count {
            builder.add(format!("key_{:04}", i * 10).as_bytes(), format!("value_{}", i).as_bytes());
        }
        builder.build(id, dir.path().join(format!("{}.sst", id))).unwrap()
    }

    #[test]
    fn test_read_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let table = build_table(&temp_dir, 1, 100);

        let mut seen = 0;
        for idx in 0..table.num_blocks() {
            let block = table.read_block(idx).unwrap();
            let mut iter = BlockIterator::create_and_seek_to_first(block);
            assert_eq!(iter.key(), table.block_meta()[idx].first_key.as_ref());
            while iter.is_valid() {
                seen += 1;
                iter.next();
            }
        }
        assert_eq!(seen, 100);
        assert!(table.read_block(table.num_blocks()).is_err());
    }

    #[test]
    fn test_find_block_idx() {
        let temp_dir = TempDir::new().unwrap();
        let table = build_table(&temp_dir, 1, 100);
        let metas = table.block_meta().to_vec();

        assert_eq!(table.find_block_idx(b"a"), 0);
        assert_eq!(table.find_block_idx(b"zzzz"), metas.len() - 1);
        for (idx, meta) in metas.iter().enumerate() {
            assert_eq!(table.find_block_idx(&meta.first_key), idx);
            assert_eq!(table.find_block_idx(&meta.last_key), idx);
        }
    }

    #[test]
    fn test_key_range_and_bloom() {
        let temp_dir = TempDir::new().unwrap();
        let table = build_table(&temp_dir, 1, 100);

        assert!(table.key_within(b"key_0000"));
        assert!(table.key_within(b"key_0990"));
        assert!(!table.key_within(b"key_0991"));
        assert!(!table.key_within(b"a"));
        assert!(table.range_overlap(b"a", b"key_0000"));
        assert!(!table.range_overlap(b"l", b"z"));

        for i in 0..100 {
            assert!(table.may_contain(format!("key_{:04}", i * 10).as_bytes()));
        }
    }

    #[test]
    fn test_block_corruption_detected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.sst");
        let table = build_table(&temp_dir, 1, 100);
        let second = table.block_meta()[1].offset;
        drop(table);

        let mut raw = std::fs::read(&path).unwrap();
        raw[second + 3] ^= 0x5a;
        std::fs::write(&path, &raw).unwrap();

        let table = SsTable::open(1, FileObject::open(&path).unwrap()).unwrap();
        assert!(table.read_block(0).is_ok());
        let err = table.read_block(1).unwrap_err();
        assert!(matches!(err, StrataError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.sst");
        drop(build_table(&temp_dir, 1, 10));

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 9]).unwrap();
        assert!(SsTable::open(1, FileObject::open(&path).unwrap()).is_err());

        std::fs::write(&path, &raw[..2]).unwrap();
        assert!(SsTable::open(1, FileObject::open(&path).unwrap())
            .unwrap_err()
            .is_corruption());
    }
}
