//! SSTable builder for writing sorted tables

use super::block::BlockBuilder;
use super::bloom::BloomFilter;
use super::format::{block_checksum, BlockHandle, Footer, BLOCK_TRAILER_SIZE};
use crate::options::{CompressionType, Options};
use crate::types::{extract_user_key, InternalKeyComparator};
use crate::Result;
use bytes::BufMut;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes internal-key-ordered entries into a new table file
pub struct TableBuilder {
    writer: BufWriter<File>,
    path: PathBuf,
    icmp: InternalKeyComparator,
    block_size: usize,
    compression: CompressionType,
    bloom_bits_per_key: usize,
    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    /// Handle of the last flushed data block, indexed once the next key is known
    pending_handle: Option<BlockHandle>,
    last_key: Vec<u8>,
    key_hashes: Vec<u64>,
    num_entries: u64,
    finished: bool,
}

impl TableBuilder {
    /// Create a builder writing to a new file at `path`
    pub fn create(path: impl AsRef<Path>, options: &Options, icmp: InternalKeyComparator) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            icmp,
            block_size: options.block_size,
            compression: options.compression,
            bloom_bits_per_key: options.bloom_bits_per_key,
            offset: 0,
            data_block: BlockBuilder::new(options.block_restart_interval),
            // Index keys are looked up by binary search only
            index_block: BlockBuilder::new(1),
            pending_handle: None,
            last_key: Vec::new(),
            key_hashes: Vec::new(),
            num_entries: 0,
            finished: false,
        })
    }

    /// Add an entry; keys must be strictly increasing in internal-key order
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        debug_assert!(
            self.num_entries == 0 || self.icmp.compare(&self.last_key, key) == Ordering::Less,
            "keys added out of order"
        );

        if let Some(handle) = self.pending_handle.take() {
            self.index_block.add(&self.last_key, &handle.encode());
        }

        if self.bloom_bits_per_key > 0 {
            let user_key = extract_user_key(key);
            let hash = BloomFilter::hash(user_key);
            // Consecutive versions of one user key share a hash
            if self.key_hashes.last() != Some(&hash) {
                self.key_hashes.push(hash);
            }
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let contents = self.data_block.finish().to_vec();
        let handle = self.write_block(&contents, self.compression)?;
        self.data_block.reset();
        self.pending_handle = Some(handle);
        Ok(())
    }

    fn write_block(&mut self, raw: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let (contents, kind) = match compression {
            CompressionType::None => (raw.to_vec(), CompressionType::None),
            CompressionType::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(raw);
                // Keep compression only when it saves at least 12.5%
                if compressed.len() < raw.len() - raw.len() / 8 {
                    (compressed, CompressionType::Lz4)
                } else {
                    (raw.to_vec(), CompressionType::None)
                }
            }
        };

        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
        trailer.put_u8(kind as u8);
        trailer.put_u32_le(block_checksum(&contents, kind as u8));

        self.writer.write_all(&contents)?;
        self.writer.write_all(&trailer)?;
        self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    /// Write the filter, index and footer, sync, and return the file size
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        self.finished = true;

        let filter_handle = if self.bloom_bits_per_key > 0 && !self.key_hashes.is_empty() {
            let filter = BloomFilter::from_hashes(&self.key_hashes, self.bloom_bits_per_key);
            self.write_block(&filter.encode(), CompressionType::None)?
        } else {
            BlockHandle::default()
        };

        if let Some(handle) = self.pending_handle.take() {
            self.index_block.add(&self.last_key, &handle.encode());
        }
        let index_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&index_contents, self.compression)?;

        let footer = Footer {
            index_handle,
            filter_handle,
        }
        .encode();
        self.writer.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        tracing::debug!(
            "Finished table {:?}: {} entries, {} bytes",
            self.path,
            self.num_entries,
            self.offset
        );
        Ok(self.offset)
    }

    /// Number of entries added so far
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far plus the unflushed block
    pub fn file_size(&self) -> u64 {
        self.offset + self.data_block.current_size_estimate() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
