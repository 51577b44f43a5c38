//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk storage with:
//! - Checksummed, binary-searchable data blocks
//! - A block index holding each block's first and last key
//! - A Bloom filter over every key in the table
//!
//! File layout (integers big-endian):
//!
//! ```text
//! | block #1 | crc32 | ... | block #N | crc32 | block meta | bloom filter | meta offset (u32) |
//! block meta = count (u32) | { offset (u32), first_key_len (u16), first_key,
//!                             last_key_len (u16), last_key }*
//! ```

mod block;
mod block_iter;
mod bloom;
mod builder;
mod iterator;
mod reader;

pub use block::{Block, BlockBuilder};
pub use block_iter::BlockIterator;
pub use bloom::{hash_key, BloomFilter};
pub use builder::SsTableBuilder;
pub use iterator::SsTableIterator;
pub use reader::SsTable;

use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the per-block checksum and of the trailing meta offset
pub(crate) const SIZEOF_U32: usize = std::mem::size_of::<u32>();

/// File name of table `id` inside a data directory
pub fn sst_path(dir: &Path, id: usize) -> PathBuf {
    dir.join(format!("{}.sst", id))
}

/// Parse a table id back out of a file name produced by [`sst_path`]
pub fn parse_sst_id(path: &Path) -> Option<usize> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_suffix(".sst"))
        .and_then(|s| s.parse().ok())
}

/// Location and key range of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// Offset of the block inside the table file
    pub offset: usize,
    /// First key in the block
    pub first_key: Bytes,
    /// Last key in the block
    pub last_key: Bytes,
}

impl BlockMeta {
    /// Append the meta section for `metas` to `buf`
    pub fn encode_block_meta(metas: &[BlockMeta], buf: &mut impl BufMut) {
        buf.put_u32(metas.len() as u32);
        for meta in metas {
            buf.put_u32(meta.offset as u32);
            buf.put_u16(meta.first_key.len() as u16);
            buf.put_slice(&meta.first_key);
            buf.put_u16(meta.last_key.len() as u16);
            buf.put_slice(&meta.last_key);
        }
    }

    /// Decode a meta section from the front of `data`
    ///
    /// Returns the metas and the number of bytes consumed.
    pub fn decode_block_meta(data: &[u8]) -> Result<(Vec<BlockMeta>, usize)> {
        let mut buf = data;
        let count = read_u32(&mut buf, "block meta count")? as usize;
        let mut metas = Vec::with_capacity(count.min(buf.len()));
        for _ in 0..count {
            let offset = read_u32(&mut buf, "block offset")? as usize;
            let first_key = read_key(&mut buf)?;
            let last_key = read_key(&mut buf)?;
            metas.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        Ok((metas, data.len() - buf.len()))
    }
}

fn read_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    if buf.remaining() < SIZEOF_U32 {
        return Err(StrataError::Corruption(format!("truncated {}", what)));
    }
    Ok(buf.get_u32())
}

fn read_key(buf: &mut &[u8]) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(StrataError::Corruption("truncated key length".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(StrataError::Corruption("truncated block meta key".into()));
    }
    let key = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(key)
}

/// Handle to a table file on disk
pub struct FileObject {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileObject {
    /// Write `data` to a new file and sync it before returning
    pub fn create(path: &Path, data: &[u8]) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: data.len() as u64,
        })
    }

    /// Open an existing file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }

    /// Read `len` bytes at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.size {
            return Err(StrataError::Corruption(format!(
                "read of {} bytes at {} past end of {:?} ({} bytes)",
                len, offset, self.path, self.size
            )));
        }
        let mut data = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path on disk
    pub fn path(&self) -> &Path {
        &self.path
    }
}
