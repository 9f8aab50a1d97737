//! SSTable reader for point lookups and iteration

use super::block::Block;
use super::bloom::BloomFilter;
use super::format::{read_block, BlockHandle, Footer, FOOTER_SIZE};
use crate::cache::Cache;
use crate::iterator::{BlockSource, InternalIterator, TwoLevelIterator};
use crate::options::ReadOptions;
use crate::types::{extract_user_key, InternalKeyComparator};
use crate::{Result, TideError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// An open, immutable table file
pub struct Table {
    file: Mutex<File>,
    path: PathBuf,
    file_size: u64,
    icmp: InternalKeyComparator,
    index_block: Arc<Block>,
    filter: Option<BloomFilter>,
    cache: Option<Arc<Cache>>,
    cache_id: u64,
}

impl Table {
    /// Open a table file of `file_size` bytes.
    ///
    /// The footer, index and filter are read (and checksummed) eagerly; data
    /// blocks are read on demand through `cache`.
    pub fn open(
        path: impl AsRef<Path>,
        file_size: u64,
        icmp: InternalKeyComparator,
        cache: Option<Arc<Cache>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if file_size < FOOTER_SIZE as u64 {
            return Err(TideError::Corruption(format!(
                "{} is too short to be a table",
                path.display()
            )));
        }

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        let footer = Footer::decode(&footer)?;

        let index_block = Arc::new(Block::new(read_block(&mut file, &footer.index_handle, true)?)?);

        let filter = if footer.filter_handle.size > 0 {
            match read_block(&mut file, &footer.filter_handle, true) {
                Ok(data) => BloomFilter::decode(&data),
                Err(e) => {
                    // Reads still work without the filter
                    warn!("Ignoring unreadable filter in {:?}: {}", path, e);
                    None
                }
            }
        } else {
            None
        };

        let cache_id = cache.as_ref().map(|c| c.new_id()).unwrap_or(0);

        Ok(Self {
            file: Mutex::new(file),
            path,
            file_size,
            icmp,
            index_block,
            filter,
            cache,
            cache_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read a data block, going through the block cache
    fn read_data_block(&self, handle: &BlockHandle, verify: bool, fill_cache: bool) -> Result<Arc<Block>> {
        let cache_key = (self.cache_id, handle.offset);
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.lookup(&cache_key) {
                return Ok(block);
            }
        }

        let contents = {
            let mut file = self.file.lock();
            read_block(&mut file, handle, verify)?
        };
        let block = Arc::new(Block::new(contents)?);

        if fill_cache {
            if let Some(cache) = &self.cache {
                cache.insert(cache_key, block.clone());
            }
        }
        Ok(block)
    }

    fn block_iter(&self, handle_bytes: &[u8], verify: bool, fill_cache: bool) -> Result<Box<dyn InternalIterator>> {
        let handle = BlockHandle::decode(handle_bytes)?;
        let block = self.read_data_block(&handle, verify, fill_cache)?;
        Ok(Box::new(block.iter(self.icmp.clone())))
    }

    /// First entry with internal key >= `key` in the block that could hold
    /// it, or `None` when the filter or index rules the key out.
    ///
    /// The caller checks whether the returned user key matches.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(extract_user_key(key)) {
                return Ok(None);
            }
        }

        let mut index = self.index_block.iter(self.icmp.clone());
        index.seek(key);
        index.status()?;
        if !index.valid() {
            return Ok(None);
        }

        let mut block = self.block_iter(index.value(), options.verify_checksums, options.fill_cache)?;
        block.seek(key);
        block.status()?;
        if block.valid() {
            Ok(Some((block.key().to_vec(), block.value().to_vec())))
        } else {
            Ok(None)
        }
    }

    /// Iterator over every entry in the table
    pub fn iter(self: &Arc<Self>, options: &ReadOptions) -> Box<dyn InternalIterator> {
        Box::new(TwoLevelIterator::new(
            Box::new(self.index_block.iter(self.icmp.clone())),
            TableBlockSource {
                table: self.clone(),
                verify_checksums: options.verify_checksums,
                fill_cache: options.fill_cache,
            },
        ))
    }

    /// Approximate file offset where data for `key` begins
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index = self.index_block.iter(self.icmp.clone());
        index.seek(key);
        if index.valid() {
            if let Ok(handle) = BlockHandle::decode(index.value()) {
                return handle.offset;
            }
        }
        // Past the last key: the data region ends where the index begins
        self.file_size.saturating_sub(self.index_block.size() as u64 + FOOTER_SIZE as u64)
    }

    /// Visit every entry of every block that passes its checksum.
    ///
    /// Returns the number of blocks that could not be read.
    pub fn scan_readable(&self, mut visit: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<usize> {
        let mut bad_blocks = 0;
        let mut index = self.index_block.iter(self.icmp.clone());
        index.seek_to_first();
        while index.valid() {
            match self.block_iter(index.value(), true, false) {
                Ok(mut block) => {
                    block.seek_to_first();
                    while block.valid() {
                        visit(block.key(), block.value())?;
                        block.next();
                    }
                    if let Err(e) = block.status() {
                        warn!("Partially readable block in {:?}: {}", self.path, e);
                        bad_blocks += 1;
                    }
                }
                Err(e) => {
                    warn!("Skipping unreadable block in {:?}: {}", self.path, e);
                    bad_blocks += 1;
                }
            }
            index.next();
        }
        index.status()?;
        Ok(bad_blocks)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .finish()
    }
}

struct TableBlockSource {
    table: Arc<Table>,
    verify_checksums: bool,
    fill_cache: bool,
}

impl BlockSource for TableBlockSource {
    fn open_block(&self, handle: &[u8]) -> Result<Box<dyn InternalIterator>> {
        self.table
            .block_iter(handle, self.verify_checksums, self.fill_cache)
    }
}
