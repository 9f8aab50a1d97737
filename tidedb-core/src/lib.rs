//! TideDB Core - Embedded Ordered Key-Value Storage Engine
//!
//! An LSM-tree storage engine offering:
//! - Atomic batched writes with crash-recoverable durability
//! - Point lookups and bidirectional ordered iteration
//! - Point-in-time snapshots
//!
//! # Architecture
//!
//! - **WAL (Write-Ahead Log)**: every batch is logged before it becomes visible
//! - **MemTable**: in-memory skip list absorbing writes
//! - **SSTable**: immutable sorted block-structured files with an LRU block cache
//! - **Version set**: manifest of the live table files per level
//! - **Compaction**: background leveled merging to bound read amplification
//!
//! ```no_run
//! use tidedb_core::{Database, Options, ReadOptions, WriteOptions};
//!
//! let mut options = Options::default();
//! options.set_create_if_missing(true);
//! let db = Database::open("/tmp/tide", options)?;
//! db.put(&WriteOptions::default(), b"key", b"value")?;
//! assert_eq!(db.get(&ReadOptions::default(), b"key")?.as_deref(), Some(&b"value"[..]));
//! # Ok::<(), tidedb_core::TideError>(())
//! ```

pub mod batch;
pub mod cache;
pub mod compaction;
pub mod db;
pub mod env;
pub mod iterator;
pub mod memtable;
pub mod options;
pub mod sstable;
pub mod version;
pub mod wal;

mod error;
mod types;

pub use batch::WriteBatch;
pub use cache::Cache;
pub use db::{destroy_database, repair_database, Database, DbIterator, Snapshot};
pub use env::{default_env, DefaultEnv, Env, ManualEnv};
pub use error::{Result, TideError};
pub use options::{CompressionType, Options, ReadOptions, WriteOptions};
pub use types::*;

/// TideDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// MemTable size before it is frozen and flushed (4MB)
    pub const WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

    /// Open table files kept by the table cache
    pub const MAX_OPEN_FILES: usize = 1000;

    /// Smallest accepted `max_open_files`
    pub const MIN_OPEN_FILES: usize = 20;

    /// Table files reserved for uses other than the table cache
    pub const NON_TABLE_CACHE_FILES: usize = 10;

    /// SSTable block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Keys between restart points in a block
    pub const BLOCK_RESTART_INTERVAL: usize = 16;

    /// Bloom filter bits per key (~1% false positives)
    pub const BLOOM_BITS_PER_KEY: usize = 10;

    /// Compaction output file size (2MB)
    pub const TARGET_FILE_SIZE: usize = 2 * 1024 * 1024;

    /// Number of levels
    pub const NUM_LEVELS: usize = 7;

    /// L0 files that trigger a compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// L0 files at which writers are delayed
    pub const L0_SLOWDOWN_TRIGGER: usize = 8;

    /// L0 files at which writers stop until compaction catches up
    pub const L0_STOP_TRIGGER: usize = 12;

    /// Maximum bytes in level 1 (10MB)
    pub const MAX_BYTES_FOR_LEVEL_BASE: u64 = 10 * 1024 * 1024;

    /// Size ratio between levels
    pub const LEVEL_SIZE_RATIO: u64 = 10;

    /// Block cache created when none is supplied (8MB)
    pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 8 * 1024 * 1024;
}
