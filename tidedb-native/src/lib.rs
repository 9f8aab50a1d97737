//! # TideDB Native
//!
//! The boundary-call surface a foreign runtime uses to drive TideDB.
//!
//! Every engine object (database, iterator, snapshot, write batch, option
//! bundles, cache, environment, info log) lives in a [`HandleTable`] and is
//! referred to from the other side by an opaque non-zero integer. Handles
//! are checked on every call, so a destroyed or forged handle yields an error
//! message instead of touching freed memory. Byte buffers cross by value and
//! every fallible call returns `Result<_, String>`, which the glue turns
//! into its host's exception convention.
//!
//! ```no_run
//! use tidedb_native::NativeInterface;
//!
//! let ni = NativeInterface::new();
//! let options = ni.options_create();
//! ni.options_set_create_if_missing(options, true)?;
//! let wo = ni.writeoptions_create();
//! let ro = ni.readoptions_create();
//!
//! let db = ni.open(options, Some("/tmp/native.tidedb"))?;
//! ni.put(db, wo, b"key", b"value")?;
//! assert_eq!(ni.get(db, ro, b"key")?.as_deref(), Some(&b"value"[..]));
//! ni.close(db)?;
//! # Ok::<(), String>(())
//! ```

pub mod error;
pub mod handle;

pub use error::{NativeError, NativeResult};
pub use handle::{Handle, HandleTable};

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::sync::{Arc, OnceLock};
use tidedb_core::{
    default_env, destroy_database, repair_database, Cache, CompressionType, Database, DbIterator, Env, Options,
    ReadOptions, Snapshot, WriteBatch, WriteOptions,
};
use tracing::{debug, info, Dispatch};

type Shared<T> = Arc<Mutex<T>>;

fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Registry of every object handed across the boundary
pub struct NativeInterface {
    databases: HandleTable<Arc<Database>>,
    iterators: HandleTable<Shared<DbIterator>>,
    /// Each snapshot with the database handle that created it
    snapshots: HandleTable<(Snapshot, Handle)>,
    batches: HandleTable<Shared<WriteBatch>>,
    options: HandleTable<Shared<Options>>,
    read_options: HandleTable<Shared<ReadOptions>>,
    write_options: HandleTable<Shared<WriteOptions>>,
    caches: HandleTable<Arc<Cache>>,
    envs: HandleTable<Arc<dyn Env>>,
    loggers: HandleTable<Dispatch>,
}

impl Default for NativeInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeInterface {
    pub fn new() -> Self {
        Self {
            databases: HandleTable::new("database"),
            iterators: HandleTable::new("iterator"),
            snapshots: HandleTable::new("snapshot"),
            batches: HandleTable::new("write batch"),
            options: HandleTable::new("options"),
            read_options: HandleTable::new("read options"),
            write_options: HandleTable::new("write options"),
            caches: HandleTable::new("cache"),
            envs: HandleTable::new("env"),
            loggers: HandleTable::new("logger"),
        }
    }

    /// Process-wide instance for glue code that has nowhere to keep one
    pub fn global() -> &'static NativeInterface {
        static GLOBAL: OnceLock<NativeInterface> = OnceLock::new();
        GLOBAL.get_or_init(NativeInterface::new)
    }

    // ---- Database ----

    pub fn open(&self, options: Handle, name: Option<&str>) -> NativeResult<Handle> {
        let name = name.ok_or(NativeError::NullArgument("database name"))?;
        let options = self.options.get(options)?.lock().clone();
        let db = Database::open(name, options).map_err(NativeError::from)?;
        let handle = self.databases.insert(Arc::new(db));
        debug!(handle, name, "Opened database");
        Ok(handle)
    }

    /// Close and unregister the database. Iterators and snapshots created
    /// from it stay usable until destroyed.
    pub fn close(&self, db: Handle) -> NativeResult<()> {
        let database = self.databases.remove(db)?;
        database.close().map_err(NativeError::from)?;
        debug!(handle = db, "Closed database");
        Ok(())
    }

    pub fn put(&self, db: Handle, write_options: Handle, key: &[u8], value: &[u8]) -> NativeResult<()> {
        let database = self.databases.get(db)?;
        let wo = *self.write_options.get(write_options)?.lock();
        database.put(&wo, key, value).map_err(NativeError::from)?;
        Ok(())
    }

    pub fn delete(&self, db: Handle, write_options: Handle, key: &[u8]) -> NativeResult<()> {
        let database = self.databases.get(db)?;
        let wo = *self.write_options.get(write_options)?.lock();
        database.delete(&wo, key).map_err(NativeError::from)?;
        Ok(())
    }

    pub fn write(&self, db: Handle, write_options: Handle, batch: Handle) -> NativeResult<()> {
        let database = self.databases.get(db)?;
        let wo = *self.write_options.get(write_options)?.lock();
        let batch = self.batches.get(batch)?;
        let batch = batch.lock();
        database.write(&wo, &batch).map_err(NativeError::from)?;
        Ok(())
    }

    /// Copy of the value, `None` when the key is absent
    pub fn get(&self, db: Handle, read_options: Handle, key: &[u8]) -> NativeResult<Option<Vec<u8>>> {
        let database = self.databases.get(db)?;
        let ro = self.read_options.get(read_options)?.lock().clone();
        Ok(database.get(&ro, key).map_err(NativeError::from)?)
    }

    /// New unpositioned iterator
    pub fn create_iterator(&self, db: Handle, read_options: Handle) -> NativeResult<Handle> {
        let database = self.databases.get(db)?;
        let ro = self.read_options.get(read_options)?.lock().clone();
        let iter = database.iter(&ro).map_err(NativeError::from)?;
        Ok(self.iterators.insert(shared(iter)))
    }

    pub fn create_snapshot(&self, db: Handle) -> NativeResult<Handle> {
        let database = self.databases.get(db)?;
        let snapshot = database.snapshot().map_err(NativeError::from)?;
        Ok(self.snapshots.insert((snapshot, db)))
    }

    /// Unregister `snapshot`, which must have been taken from `db`. Read
    /// options still pointing at it keep the view alive until they are
    /// changed or destroyed.
    pub fn release_snapshot(&self, db: Handle, snapshot: Handle) -> NativeResult<()> {
        let database = self.databases.get(db)?;
        let (_, owner) = self.snapshots.get(snapshot)?;
        if owner != db {
            return Err(NativeError::InvalidArgument(format!(
                "snapshot {:#x} belongs to database {:#x}, not {:#x}",
                snapshot, owner, db
            ))
            .into());
        }
        let (snapshot, _) = self.snapshots.remove(snapshot)?;
        database.release_snapshot(snapshot);
        Ok(())
    }

    pub fn property_value(&self, db: Handle, name: Option<&str>) -> NativeResult<Option<String>> {
        let database = self.databases.get(db)?;
        let name = name.ok_or(NativeError::NullArgument("property name"))?;
        Ok(database.property(name))
    }

    pub fn destroy_db(&self, options: Handle, name: Option<&str>) -> NativeResult<()> {
        let name = name.ok_or(NativeError::NullArgument("database name"))?;
        let options = self.options.get(options)?.lock().clone();
        destroy_database(name, &options).map_err(NativeError::from)?;
        Ok(())
    }

    pub fn repair_db(&self, options: Handle, name: Option<&str>) -> NativeResult<()> {
        let name = name.ok_or(NativeError::NullArgument("database name"))?;
        let options = self.options.get(options)?.lock().clone();
        repair_database(name, &options).map_err(NativeError::from)?;
        Ok(())
    }

    // ---- Iterator ----

    pub fn iter_destroy(&self, iter: Handle) -> NativeResult<()> {
        self.iterators.remove(iter)?;
        Ok(())
    }

    pub fn iter_valid(&self, iter: Handle) -> NativeResult<bool> {
        Ok(self.iterators.get(iter)?.lock().valid())
    }

    pub fn iter_seek_to_first(&self, iter: Handle) -> NativeResult<()> {
        self.iterators.get(iter)?.lock().seek_to_first();
        Ok(())
    }

    pub fn iter_seek_to_last(&self, iter: Handle) -> NativeResult<()> {
        self.iterators.get(iter)?.lock().seek_to_last();
        Ok(())
    }

    pub fn iter_seek(&self, iter: Handle, target: &[u8]) -> NativeResult<()> {
        self.iterators.get(iter)?.lock().seek(target);
        Ok(())
    }

    pub fn iter_next(&self, iter: Handle) -> NativeResult<()> {
        self.iterators.get(iter)?.lock().next();
        Ok(())
    }

    pub fn iter_prev(&self, iter: Handle) -> NativeResult<()> {
        self.iterators.get(iter)?.lock().prev();
        Ok(())
    }

    pub fn iter_key(&self, iter: Handle) -> NativeResult<Vec<u8>> {
        let iter = self.iterators.get(iter)?;
        let iter = iter.lock();
        let key = iter.key().ok_or(NativeError::IteratorNotValid)?;
        Ok(key.to_vec())
    }

    pub fn iter_value(&self, iter: Handle) -> NativeResult<Vec<u8>> {
        let iter = self.iterators.get(iter)?;
        let iter = iter.lock();
        let value = iter.value().ok_or(NativeError::IteratorNotValid)?;
        Ok(value.to_vec())
    }

    /// Message of the first error the iterator hit, if any
    pub fn iter_get_error(&self, iter: Handle) -> NativeResult<Option<String>> {
        let iter = self.iterators.get(iter)?;
        let status = iter.lock().status();
        Ok(status.err().map(|e| e.to_string()))
    }

    // ---- WriteBatch ----

    pub fn writebatch_create(&self) -> Handle {
        self.batches.insert(shared(WriteBatch::new()))
    }

    pub fn writebatch_destroy(&self, batch: Handle) -> NativeResult<()> {
        self.batches.remove(batch)?;
        Ok(())
    }

    pub fn writebatch_clear(&self, batch: Handle) -> NativeResult<()> {
        self.batches.get(batch)?.lock().clear();
        Ok(())
    }

    pub fn writebatch_put(&self, batch: Handle, key: &[u8], value: &[u8]) -> NativeResult<()> {
        self.batches.get(batch)?.lock().put(key, value);
        Ok(())
    }

    pub fn writebatch_delete(&self, batch: Handle, key: &[u8]) -> NativeResult<()> {
        self.batches.get(batch)?.lock().delete(key);
        Ok(())
    }

    // ---- Options ----

    pub fn options_create(&self) -> Handle {
        self.options.insert(shared(Options::default()))
    }

    pub fn options_destroy(&self, options: Handle) -> NativeResult<()> {
        self.options.remove(options)?;
        Ok(())
    }

    pub fn options_set_create_if_missing(&self, options: Handle, value: bool) -> NativeResult<()> {
        self.options.get(options)?.lock().set_create_if_missing(value);
        Ok(())
    }

    pub fn options_set_error_if_exists(&self, options: Handle, value: bool) -> NativeResult<()> {
        self.options.get(options)?.lock().set_error_if_exists(value);
        Ok(())
    }

    pub fn options_set_paranoid_checks(&self, options: Handle, value: bool) -> NativeResult<()> {
        self.options.get(options)?.lock().set_paranoid_checks(value);
        Ok(())
    }

    /// Use the environment behind `env`; 0 restores the default
    pub fn options_set_env(&self, options: Handle, env: Handle) -> NativeResult<()> {
        let env = self.envs.get_optional(env)?.unwrap_or_else(default_env);
        self.options.get(options)?.lock().set_env(env);
        Ok(())
    }

    /// Route the database's log output to `logger`; 0 restores the global
    /// subscriber
    pub fn options_set_info_log(&self, options: Handle, logger: Handle) -> NativeResult<()> {
        let dispatch = self.loggers.get_optional(logger)?;
        self.options.get(options)?.lock().set_info_log(dispatch);
        Ok(())
    }

    pub fn options_set_write_buffer_size(&self, options: Handle, size: i64) -> NativeResult<()> {
        let size = positive("write buffer size", size)?;
        self.options.get(options)?.lock().set_write_buffer_size(size);
        Ok(())
    }

    pub fn options_set_max_open_files(&self, options: Handle, count: i64) -> NativeResult<()> {
        let count = positive("max open files", count)?;
        self.options.get(options)?.lock().set_max_open_files(count);
        Ok(())
    }

    /// Share the block cache behind `cache`; 0 gives each database its own
    pub fn options_set_cache(&self, options: Handle, cache: Handle) -> NativeResult<()> {
        let cache = self.caches.get_optional(cache)?;
        self.options.get(options)?.lock().set_cache(cache);
        Ok(())
    }

    pub fn options_set_block_size(&self, options: Handle, size: i64) -> NativeResult<()> {
        let size = positive("block size", size)?;
        self.options.get(options)?.lock().set_block_size(size);
        Ok(())
    }

    pub fn options_set_block_restart_interval(&self, options: Handle, interval: i64) -> NativeResult<()> {
        let interval = positive("block restart interval", interval)?;
        self.options.get(options)?.lock().set_block_restart_interval(interval);
        Ok(())
    }

    /// 0 = none, 1 = LZ4
    pub fn options_set_compression(&self, options: Handle, kind: i32) -> NativeResult<()> {
        let compression = u8::try_from(kind)
            .ok()
            .and_then(CompressionType::from_u8)
            .ok_or_else(|| NativeError::InvalidArgument(format!("unknown compression kind {}", kind)))?;
        self.options.get(options)?.lock().set_compression(compression);
        Ok(())
    }

    // ---- ReadOptions ----

    pub fn readoptions_create(&self) -> Handle {
        self.read_options.insert(shared(ReadOptions::default()))
    }

    pub fn readoptions_destroy(&self, read_options: Handle) -> NativeResult<()> {
        self.read_options.remove(read_options)?;
        Ok(())
    }

    pub fn readoptions_set_verify_checksums(&self, read_options: Handle, value: bool) -> NativeResult<()> {
        self.read_options.get(read_options)?.lock().set_verify_checksums(value);
        Ok(())
    }

    pub fn readoptions_set_fill_cache(&self, read_options: Handle, value: bool) -> NativeResult<()> {
        self.read_options.get(read_options)?.lock().set_fill_cache(value);
        Ok(())
    }

    /// Read as of `snapshot`; 0 reads the latest state
    pub fn readoptions_set_snapshot(&self, read_options: Handle, snapshot: Handle) -> NativeResult<()> {
        let snapshot = self.snapshots.get_optional(snapshot)?.map(|(snapshot, _)| snapshot);
        self.read_options.get(read_options)?.lock().set_snapshot(snapshot);
        Ok(())
    }

    // ---- WriteOptions ----

    pub fn writeoptions_create(&self) -> Handle {
        self.write_options.insert(shared(WriteOptions::default()))
    }

    pub fn writeoptions_destroy(&self, write_options: Handle) -> NativeResult<()> {
        self.write_options.remove(write_options)?;
        Ok(())
    }

    pub fn writeoptions_set_sync(&self, write_options: Handle, value: bool) -> NativeResult<()> {
        self.write_options.get(write_options)?.lock().set_sync(value);
        Ok(())
    }

    // ---- Cache, Env, Logger ----

    /// LRU block cache of `capacity` bytes, shareable between databases
    pub fn cache_create_lru(&self, capacity: i64) -> NativeResult<Handle> {
        let capacity = positive("cache capacity", capacity)?;
        Ok(self.caches.insert(Arc::new(Cache::new_lru(capacity))))
    }

    /// Unregister the cache. Databases opened with it keep using it.
    pub fn cache_destroy(&self, cache: Handle) -> NativeResult<()> {
        self.caches.remove(cache)?;
        Ok(())
    }

    pub fn create_default_env(&self) -> Handle {
        self.envs.insert(default_env())
    }

    pub fn env_destroy(&self, env: Handle) -> NativeResult<()> {
        self.envs.remove(env)?;
        Ok(())
    }

    /// Info log appending to the file at `path`, for
    /// [`options_set_info_log`](Self::options_set_info_log)
    pub fn logger_create(&self, path: Option<&str>) -> NativeResult<Handle> {
        let path = path.ok_or(NativeError::NullArgument("log file path"))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(NativeError::InfoLog)?;
        let subscriber = tracing_subscriber::fmt()
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .with_target(false)
            .finish();
        info!(path, "Created info log");
        Ok(self.loggers.insert(Dispatch::new(subscriber)))
    }

    pub fn logger_destroy(&self, logger: Handle) -> NativeResult<()> {
        self.loggers.remove(logger)?;
        Ok(())
    }

    /// Number of databases currently open through this interface
    pub fn open_databases(&self) -> usize {
        self.databases.len()
    }
}

fn positive(what: &str, value: i64) -> Result<usize, NativeError> {
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| NativeError::InvalidArgument(format!("{} must be positive, got {}", what, value)))
}
