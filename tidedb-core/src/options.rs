//! Database, read and write options
//!
//! Options are plain values. `Database::open` clones the `Options` it is
//! given, so mutating the caller's copy afterwards has no effect on an open
//! database.

use crate::cache::Cache;
use crate::db::Snapshot;
use crate::env::{default_env, Env};
use crate::types::{BytewiseComparator, Comparator};
use crate::{config, Result, TideError};
use std::fmt;
use std::sync::Arc;

/// Block compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Blocks are stored as-is
    #[default]
    None = 0,
    /// LZ4 block compression
    Lz4 = 1,
}

impl CompressionType {
    /// Decode from the on-disk tag
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

/// Options controlling a database instance
#[derive(Clone)]
pub struct Options {
    /// Ordering of user keys
    pub comparator: Arc<dyn Comparator>,
    /// Create the database if it is missing
    pub create_if_missing: bool,
    /// Fail `open` if the database already exists
    pub error_if_exists: bool,
    /// Treat any detected corruption as fatal instead of skipping it
    pub paranoid_checks: bool,
    /// Filesystem and background scheduling
    pub env: Arc<dyn Env>,
    /// Dispatcher receiving this database's log events
    pub info_log: Option<tracing::Dispatch>,
    /// Memtable size that triggers a flush
    pub write_buffer_size: usize,
    /// Number of open files the table cache may hold
    pub max_open_files: usize,
    /// Shared block cache; a private one is created when absent
    pub block_cache: Option<Arc<Cache>>,
    /// Approximate uncompressed size of a data block
    pub block_size: usize,
    /// Entries between full (non prefix-compressed) keys in a block
    pub block_restart_interval: usize,
    /// Compression applied to every block
    pub compression: CompressionType,
    /// Bloom filter bits per key; 0 disables filters
    pub bloom_bits_per_key: usize,
    /// Size at which compaction output is split into a new table
    pub max_file_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            env: default_env(),
            info_log: None,
            write_buffer_size: config::WRITE_BUFFER_SIZE,
            max_open_files: config::MAX_OPEN_FILES,
            block_cache: None,
            block_size: config::BLOCK_SIZE,
            block_restart_interval: config::BLOCK_RESTART_INTERVAL,
            compression: CompressionType::None,
            bloom_bits_per_key: config::BLOOM_BITS_PER_KEY,
            max_file_size: config::TARGET_FILE_SIZE,
        }
    }
}

impl Options {
    /// Create options with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create_if_missing(&mut self, value: bool) -> &mut Self {
        self.create_if_missing = value;
        self
    }

    pub fn set_error_if_exists(&mut self, value: bool) -> &mut Self {
        self.error_if_exists = value;
        self
    }

    pub fn set_paranoid_checks(&mut self, value: bool) -> &mut Self {
        self.paranoid_checks = value;
        self
    }

    pub fn set_env(&mut self, env: Arc<dyn Env>) -> &mut Self {
        self.env = env;
        self
    }

    pub fn set_info_log(&mut self, dispatch: Option<tracing::Dispatch>) -> &mut Self {
        self.info_log = dispatch;
        self
    }

    pub fn set_write_buffer_size(&mut self, size: usize) -> &mut Self {
        self.write_buffer_size = size;
        self
    }

    pub fn set_max_open_files(&mut self, count: usize) -> &mut Self {
        self.max_open_files = count;
        self
    }

    pub fn set_cache(&mut self, cache: Option<Arc<Cache>>) -> &mut Self {
        self.block_cache = cache;
        self
    }

    pub fn set_block_size(&mut self, size: usize) -> &mut Self {
        self.block_size = size;
        self
    }

    pub fn set_block_restart_interval(&mut self, interval: usize) -> &mut Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn set_compression(&mut self, compression: CompressionType) -> &mut Self {
        self.compression = compression;
        self
    }

    pub fn set_comparator(&mut self, comparator: Arc<dyn Comparator>) -> &mut Self {
        self.comparator = comparator;
        self
    }

    pub fn set_bloom_bits_per_key(&mut self, bits: usize) -> &mut Self {
        self.bloom_bits_per_key = bits;
        self
    }

    /// Reject sizes the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(TideError::InvalidArgument(
                "write_buffer_size must be positive".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(TideError::InvalidArgument("block_size must be positive".into()));
        }
        if self.block_restart_interval == 0 {
            return Err(TideError::InvalidArgument(
                "block_restart_interval must be positive".into(),
            ));
        }
        if self.max_open_files < config::MIN_OPEN_FILES {
            return Err(TideError::InvalidArgument(format!(
                "max_open_files must be at least {}",
                config::MIN_OPEN_FILES
            )));
        }
        if self.max_file_size == 0 {
            return Err(TideError::InvalidArgument("max_file_size must be positive".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("comparator", &self.comparator.name())
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("info_log", &self.info_log.is_some())
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_cache", &self.block_cache.as_ref().map(|c| c.capacity()))
            .field("block_size", &self.block_size)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("compression", &self.compression)
            .field("bloom_bits_per_key", &self.bloom_bits_per_key)
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

/// Options for read operations
#[derive(Clone, Debug)]
pub struct ReadOptions {
    /// Verify block checksums on every read
    pub verify_checksums: bool,
    /// Insert blocks read by this operation into the block cache
    pub fill_cache: bool,
    /// Read as of this snapshot instead of the latest state
    pub snapshot: Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_verify_checksums(&mut self, value: bool) -> &mut Self {
        self.verify_checksums = value;
        self
    }

    pub fn set_fill_cache(&mut self, value: bool) -> &mut Self {
        self.fill_cache = value;
        self
    }

    pub fn set_snapshot(&mut self, snapshot: Option<Snapshot>) -> &mut Self {
        self.snapshot = snapshot;
        self
    }
}

/// Options for write operations
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Fsync the log before the write returns
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sync(&mut self, value: bool) -> &mut Self {
        self.sync = value;
        self
    }
}
