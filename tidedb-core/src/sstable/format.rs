//! Table file layout: block handles, block trailers and the footer
//!
//! ```text
//! [data block][trailer] ... [filter block][trailer] [index block][trailer] [footer]
//! trailer = [compression u8][crc32 of block ‖ compression]
//! footer  = [index handle][filter handle][format version u32][reserved u32][magic u64]
//! ```

use crate::options::CompressionType;
use crate::{Result, TideError};
use bytes::{Buf, BufMut, Bytes};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// Magic number ending every table file ("tidedbss")
pub const TABLE_MAGIC: u64 = 0x7469_6465_6462_7373;

/// Current table format version
pub const FORMAT_VERSION: u32 = 1;

/// Compression tag plus CRC32
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Fixed footer size
pub const FOOTER_SIZE: usize = 2 * BlockHandle::ENCODED_LENGTH + 16;

/// Location of a block within a table file (excluding its trailer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_LENGTH: usize = 16;

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LENGTH);
        self.encode_to(&mut buf);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_LENGTH {
            return Err(TideError::Corruption("bad block handle".into()));
        }
        Ok(Self {
            offset: data.get_u64_le(),
            size: data.get_u64_le(),
        })
    }
}

/// Fixed-size tail of a table file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_handle: BlockHandle,
    /// Zero-sized when the table has no filter
    pub filter_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.index_handle.encode_to(&mut buf);
        self.filter_handle.encode_to(&mut buf);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(0);
        buf.put_u64_le(TABLE_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(TideError::Corruption("truncated table footer".into()));
        }
        let mut tail = &data[FOOTER_SIZE - 16..];
        let version = tail.get_u32_le();
        let _reserved = tail.get_u32_le();
        let magic = tail.get_u64_le();
        if magic != TABLE_MAGIC {
            return Err(TideError::Corruption("not a table file (bad magic)".into()));
        }
        if version != FORMAT_VERSION {
            return Err(TideError::Corruption(format!(
                "unsupported table format version {}",
                version
            )));
        }
        Ok(Self {
            index_handle: BlockHandle::decode(&data[..BlockHandle::ENCODED_LENGTH])?,
            filter_handle: BlockHandle::decode(&data[BlockHandle::ENCODED_LENGTH..])?,
        })
    }
}

pub(crate) fn block_checksum(block: &[u8], compression: u8) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(block);
    hasher.update(&[compression]);
    hasher.finalize()
}

/// Read the block at `handle` and return its uncompressed contents
pub(crate) fn read_block(file: &mut File, handle: &BlockHandle, verify_checksum: bool) -> Result<Bytes> {
    let n = handle.size as usize;
    let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TideError::Corruption(format!("truncated block read at offset {}", handle.offset))
        } else {
            TideError::Io(e)
        }
    })?;

    let compression = buf[n];
    if verify_checksum {
        let mut stored = &buf[n + 1..];
        let expected = stored.get_u32_le();
        let actual = block_checksum(&buf[..n], compression);
        if expected != actual {
            return Err(TideError::ChecksumMismatch { expected, actual });
        }
    }

    buf.truncate(n);
    match CompressionType::from_u8(compression) {
        Some(CompressionType::None) => Ok(Bytes::from(buf)),
        Some(CompressionType::Lz4) => decompress_lz4(&buf).map(Bytes::from),
        None => Err(TideError::Corruption(format!(
            "unknown block compression type {}",
            compression
        ))),
    }
}

/// LZ4 cannot expand input by more than this factor
const MAX_LZ4_RATIO: usize = 255;

/// Decode a size-prepended LZ4 block, rejecting a size prefix no real block could have
fn decompress_lz4(block: &[u8]) -> Result<Vec<u8>> {
    if block.len() < 4 {
        return Err(TideError::Corruption("lz4 block shorter than its size prefix".into()));
    }
    let claimed = (&block[..4]).get_u32_le() as usize;
    let limit = (block.len() - 4).saturating_mul(MAX_LZ4_RATIO).saturating_add(64);
    if claimed > limit {
        return Err(TideError::Corruption(format!(
            "lz4 block claims {} bytes from {} compressed",
            claimed,
            block.len() - 4
        )));
    }
    lz4_flex::decompress_size_prepended(block).map_err(|e| TideError::Compression(e.to_string()))
}
