//! SSTable builder for writing sorted data to disk

use super::{hash_key, BlockBuilder, BlockMeta, BloomFilter, FileObject, SsTable, SIZEOF_U32};
use crate::{Result, StrataError};
use bytes::{BufMut, BytesMut};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Streams sorted records into blocks and writes the finished table
pub struct SsTableBuilder {
    builder: BlockBuilder,
    block_size: usize,
    bloom_fp_rate: f64,

    // Encoded blocks and their checksums
    data: BytesMut,
    meta: Vec<BlockMeta>,
    key_hashes: Vec<u32>,
}

impl SsTableBuilder {
    /// Create a builder with the default Bloom filter false positive rate
    pub fn new(block_size: usize) -> Self {
        Self::with_bloom_fp_rate(block_size, crate::config::BLOOM_FP_RATE)
    }

    /// Create a builder with an explicit Bloom filter false positive rate
    pub fn with_bloom_fp_rate(block_size: usize, bloom_fp_rate: f64) -> Self {
        Self {
            builder: BlockBuilder::new(block_size),
            block_size,
            bloom_fp_rate,
            data: BytesMut::new(),
            meta: Vec::new(),
            key_hashes: Vec::new(),
        }
    }

    /// Add a record; keys must arrive in ascending order
    ///
    /// An empty value is stored as-is and reads back as a tombstone.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(key.len() <= crate::MAX_KEY_LEN, "key too long for block meta");
        self.key_hashes.push(hash_key(key));

        if self.builder.add(key, value) {
            return;
        }

        self.finish_block();
        assert!(
            self.builder.add(key, value),
            "record rejected by an empty block builder"
        );
    }

    /// Bytes written so far, including the block in progress
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.builder.estimated_size()
    }

    /// True if nothing has been added
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.builder.is_empty()
    }

    fn finish_block(&mut self) {
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new(self.block_size));
        if builder.is_empty() {
            return;
        }

        self.meta.push(BlockMeta {
            offset: self.data.len(),
            first_key: builder.first_key().clone(),
            last_key: builder.last_key().clone(),
        });
        let encoded = builder.build().encode();
        self.data.put_slice(&encoded);
        self.data.put_u32(crc32fast::hash(&encoded));
    }

    /// Seal the table, write it to `path`, sync it and open it for reading
    pub fn build(mut self, id: usize, path: impl AsRef<Path>) -> Result<SsTable> {
        if self.is_empty() {
            return Err(StrataError::Internal(format!(
                "refusing to build empty SSTable {}",
                id
            )));
        }
        self.finish_block();

        let mut buf = self.data;
        let meta_offset = buf.len();
        BlockMeta::encode_block_meta(&self.meta, &mut buf);
        BloomFilter::build_from_key_hashes(&self.key_hashes, self.bloom_fp_rate).encode(&mut buf);
        check_table_size(id, buf.len() + SIZEOF_U32)?;
        buf.put_u32(meta_offset as u32);

        let path = path.as_ref();
        let file = FileObject::create(path, &buf)?;
        debug!(
            "Wrote SSTable {} with {} blocks, {} keys, {} bytes",
            id,
            self.meta.len(),
            self.key_hashes.len(),
            buf.len()
        );

        SsTable::open(id, file)
    }

    /// Build into a shared handle
    pub fn build_shared(self, id: usize, path: impl AsRef<Path>) -> Result<Arc<SsTable>> {
        self.build(id, path).map(Arc::new)
    }
}

/// Offsets in the meta section and footer are u32
fn check_table_size(id: usize, len: usize) -> Result<()> {
    if len > u32::MAX as usize {
        return Err(StrataError::Internal(format!(
            "SSTable {} would be {} bytes, over the 4 GiB format limit",
            id, len
        )));
    }
    Ok(())
}
