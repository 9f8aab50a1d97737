//! The database: write path, read path and background work
//!
//! Writers are serialized by the writer mutex and append each batch to the
//! log before inserting it into the active memtable. Readers never take the
//! writer mutex; they clone the published [`ReadView`] under a short read
//! lock and work from those references.
//!
//! Flushes and compactions are handed to the [`Env`]. A writer that has to
//! wait for one (the memtable is full while the previous one is still being
//! flushed, or level 0 has hit its hard limit) runs the work itself when no
//! background job is active, so progress never depends on the scheduler.

mod iter;
mod repair;
mod snapshot;

pub use iter::DbIterator;
pub use repair::repair_database;
pub use snapshot::Snapshot;

use self::snapshot::SnapshotList;
use crate::batch::WriteBatch;
use crate::cache::{Cache, TableCache};
use crate::compaction::{build_table, range_compaction, run_compaction, select_compaction, CompactionContext, CompactionTask, LevelStats};
use crate::config::{
    DEFAULT_BLOCK_CACHE_SIZE, L0_SLOWDOWN_TRIGGER, L0_STOP_TRIGGER, MIN_OPEN_FILES, NON_TABLE_CACHE_FILES, NUM_LEVELS,
};
use crate::env::{Env, FileLock};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::memtable::{LookupResult, MemTable, MemTableInserter};
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::types::{InternalKey, InternalKeyComparator, LookupKey, SequenceNumber, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK};
use crate::version::filename::{
    current_file_name, lock_file_name, log_file_name, parse_file_name, table_file_name, FileType,
};
use crate::version::{Version, VersionEdit, VersionSet};
use crate::wal::{LogReader, LogWriter, ReadMode};
use crate::{Result, TideError};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What readers need, swapped atomically by writers and background work
struct ReadView {
    mem: Arc<MemTable>,
    /// Memtable being flushed
    imm: Option<Arc<MemTable>>,
    version: Arc<Version>,
    last_sequence: SequenceNumber,
}

struct WriterState {
    log: Option<LogWriter>,
    /// A failed log append leaves the log in an unknown state; refuse further writes
    failed: Option<TideError>,
}

struct DbState {
    versions: VersionSet,
    /// Log backing the active memtable
    log_number: u64,
    bg_scheduled: bool,
    /// Set while a flush or compaction is running, in the background or inline
    bg_running: bool,
    /// Files being written by the running job
    pending_outputs: HashSet<u64>,
    stats: [LevelStats; NUM_LEVELS],
}

struct DbInner {
    dbname: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    env: Arc<dyn Env>,
    table_cache: Arc<TableCache>,
    writer: Mutex<WriterState>,
    state: Mutex<DbState>,
    bg_cv: Condvar,
    view: RwLock<ReadView>,
    snapshots: Arc<SnapshotList>,
    shutting_down: AtomicBool,
    closed: AtomicBool,
    file_lock: Mutex<Option<FileLock>>,
}

/// An open database directory.
///
/// `Database` is `Send + Sync`; share it between threads with an `Arc`.
/// Dropping it closes the database.
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open (or create, with `create_if_missing`) the database at `path`.
    ///
    /// `options` is validated and then owned by the database; later changes
    /// to the caller's copy have no effect.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let dispatch = options.info_log.clone();
        let inner = with_info_log(dispatch.as_ref(), || DbInner::open(path.as_ref(), options))?;
        Ok(Self { inner })
    }

    /// Wait for background work, sync the log and release the directory lock.
    ///
    /// Later calls fail with [`TideError::Closed`]. Iterators and snapshots
    /// created earlier stay usable because they hold their own references.
    pub fn close(&self) -> Result<()> {
        self.inner.log_scope(|| self.inner.close())
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, &batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, &batch)
    }

    /// Apply every operation of `batch` atomically
    pub fn write(&self, options: &WriteOptions, batch: &WriteBatch) -> Result<()> {
        self.inner.log_scope(|| self.inner.write(options, batch))
    }

    /// Value of `key`, or `None` if it is absent or deleted
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// Iterator over the database as of `options.snapshot` (or now)
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        self.inner.iter(options)
    }

    /// Capture the current state for later reads
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.check_open()?;
        // Register before a writer can publish past this sequence
        let view = self.inner.view.read();
        Ok(self.inner.snapshots.acquire(view.last_sequence))
    }

    /// Release `snapshot`. Clones of it keep the view alive until they are dropped too.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Introspection values; `None` for unknown names or a closed database.
    ///
    /// - `tidedb.num-files-at-level<N>`
    /// - `tidedb.stats`
    /// - `tidedb.sstables`
    /// - `tidedb.approximate-memory-usage`
    /// - `tidedb.last-sequence`
    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Write the memtable out to a level-0 table
    pub fn flush(&self) -> Result<()> {
        self.inner.log_scope(|| self.inner.flush())
    }

    /// Compact every level over the user key range `[begin, end]`; `None` is unbounded
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.log_scope(|| self.inner.compact_range(begin, end))
    }

    /// Approximate on-disk bytes used by each `[start, limit)` range
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Result<Vec<u64>> {
        self.inner.check_open()?;
        let version = self.inner.view.read().version.clone();
        let offset = |key: &[u8]| {
            let ikey = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            version.approximate_offset_of(ikey.encode(), &self.inner.table_cache)
        };
        Ok(ranges
            .iter()
            .map(|(start, limit)| offset(limit).saturating_sub(offset(start)))
            .collect())
    }

    /// Directory this database lives in
    pub fn path(&self) -> &Path {
        &self.inner.dbname
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing {}: {}", self.inner.dbname.display(), e);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.inner.dbname).finish()
    }
}

fn with_info_log<R>(dispatch: Option<&tracing::Dispatch>, f: impl FnOnce() -> R) -> R {
    match dispatch {
        Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
        None => f(),
    }
}

fn sanitize_options(mut options: Options) -> Options {
    options.max_open_files = options.max_open_files.max(MIN_OPEN_FILES);
    if options.block_cache.is_none() {
        options.block_cache = Some(Arc::new(Cache::new_lru(DEFAULT_BLOCK_CACHE_SIZE)));
    }
    options
}

impl DbInner {
    fn open(dbname: &Path, options: Options) -> Result<Arc<Self>> {
        let options = sanitize_options(options);
        let env = options.env.clone();

        let exists = env.file_exists(&current_file_name(dbname));
        if !exists && !options.create_if_missing {
            return Err(TideError::NotFound(format!(
                "{}: does not exist (create_if_missing is false)",
                dbname.display()
            )));
        }
        if exists && options.error_if_exists {
            return Err(TideError::AlreadyExists(format!(
                "{}: exists (error_if_exists is true)",
                dbname.display()
            )));
        }

        env.create_dir_all(dbname)?;
        let file_lock = env.lock_file(&lock_file_name(dbname))?;

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let table_cache = Arc::new(TableCache::new(
            dbname,
            icmp.clone(),
            options.block_cache.clone(),
            options.max_open_files - NON_TABLE_CACHE_FILES,
        ));
        let mut versions = VersionSet::new(dbname, icmp.clone(), table_cache.clone(), options.paranoid_checks);
        let mut edit = VersionEdit::new();
        if exists {
            versions.recover()?;
            recover_logs(dbname, &options, &icmp, env.as_ref(), &mut versions, &mut edit)?;
        } else {
            info!("Creating database {}", dbname.display());
        }

        let log_number = versions.new_file_number();
        let log_path = log_file_name(dbname, log_number);
        let log = LogWriter::create(&log_path)?;
        edit.set_log_number(log_number);
        if let Err(e) = versions.log_and_apply(&mut edit) {
            drop(log);
            let _ = env.remove_file(&log_path);
            return Err(e);
        }

        let view = ReadView {
            mem: Arc::new(MemTable::new(icmp.clone(), log_number)),
            imm: None,
            version: versions.current(),
            last_sequence: versions.last_sequence(),
        };
        info!(
            "Opened {}: {}, last sequence {}",
            dbname.display(),
            versions.current().level_summary(),
            versions.last_sequence()
        );

        let inner = Arc::new(Self {
            dbname: dbname.to_path_buf(),
            icmp,
            env,
            table_cache,
            writer: Mutex::new(WriterState {
                log: Some(log),
                failed: None,
            }),
            state: Mutex::new(DbState {
                versions,
                log_number,
                bg_scheduled: false,
                bg_running: false,
                pending_outputs: HashSet::new(),
                stats: [LevelStats::default(); NUM_LEVELS],
            }),
            bg_cv: Condvar::new(),
            view: RwLock::new(view),
            snapshots: Arc::new(SnapshotList::new()),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            file_lock: Mutex::new(Some(file_lock)),
            options,
        });

        {
            let mut state = inner.state.lock();
            inner.delete_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }
        Ok(inner)
    }

    fn log_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        with_info_log(self.options.info_log.as_ref(), f)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TideError::Closed)
        } else {
            Ok(())
        }
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutting_down.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            while state.bg_running {
                self.bg_cv.wait(&mut state);
            }
        }

        let synced = match self.writer.lock().log.take() {
            Some(mut log) => log.sync(),
            None => Ok(()),
        };
        self.file_lock.lock().take();
        info!("Closed {}", self.dbname.display());
        synced
    }

    fn write(self: &Arc<Self>, options: &WriteOptions, batch: &WriteBatch) -> Result<()> {
        self.check_open()?;
        // Reject malformed batches before anything reaches the log
        batch.validate()?;

        let mut writer = self.writer.lock();
        if let Some(e) = &writer.failed {
            return Err(e.duplicate());
        }
        if writer.log.is_none() {
            return Err(TideError::Closed);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.make_room_for_write(&mut writer, false)?;

        let (mem, last_sequence) = {
            let view = self.view.read();
            (view.mem.clone(), view.last_sequence)
        };
        let first = last_sequence + 1;
        let mut batch = batch.clone();
        batch.set_sequence(first);

        let log = writer.log.as_mut().ok_or(TideError::Closed)?;
        if let Err(e) = log.add_record(batch.contents(), options.sync) {
            error!("Log append failed: {}", e);
            writer.failed = Some(e.duplicate());
            return Err(e);
        }
        batch.iterate(&mut MemTableInserter {
            sequence: first,
            mem: &mem,
        })?;

        // Publish only once the whole batch is in the memtable
        let last = first + u64::from(batch.count()) - 1;
        let mut state = self.state.lock();
        state.versions.set_last_sequence(last);
        self.view.write().last_sequence = last;
        Ok(())
    }

    /// Make sure the active memtable has space, stalling the writer when
    /// flushes or level-0 compactions fall behind
    fn make_room_for_write(self: &Arc<Self>, writer: &mut WriterState, mut force: bool) -> Result<()> {
        let mut state = self.state.lock();
        let mut allow_delay = !force;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(TideError::Closed);
            }
            let (mem_usage, has_imm) = {
                let view = self.view.read();
                (view.mem.approximate_memory_usage(), view.imm.is_some())
            };
            let level0 = state.versions.num_level_files(0);

            if allow_delay && level0 >= L0_SLOWDOWN_TRIGGER {
                // Hand compaction some time now instead of stopping later
                MutexGuard::unlocked(&mut state, || thread::sleep(Duration::from_millis(1)));
                allow_delay = false;
            } else if !force && mem_usage <= self.options.write_buffer_size {
                return Ok(());
            } else if has_imm {
                info!("Memtable full; waiting for flush");
                self.wait_for_background(&mut state)?;
            } else if level0 >= L0_STOP_TRIGGER {
                info!("Too many level-0 files ({}); waiting for compaction", level0);
                self.wait_for_background(&mut state)?;
            } else {
                self.switch_memtable(writer, &mut state)?;
                force = false;
                self.maybe_schedule_compaction(&mut state);
            }
        }
    }

    /// Freeze the active memtable and start a new log for its successor
    fn switch_memtable(&self, writer: &mut WriterState, state: &mut DbState) -> Result<()> {
        let number = state.versions.new_file_number();
        let log = match LogWriter::create(log_file_name(&self.dbname, number)) {
            Ok(log) => log,
            Err(e) => {
                state.versions.reuse_file_number(number);
                return Err(e);
            }
        };
        writer.log = Some(log);
        state.log_number = number;

        let mut view = self.view.write();
        let full = std::mem::replace(&mut view.mem, Arc::new(MemTable::new(self.icmp.clone(), number)));
        debug!(
            "Switched to log #{}; frozen memtable holds {} entries",
            number,
            full.len()
        );
        view.imm = Some(full);
        Ok(())
    }

    /// Wait for the running job, or run the pending work inline if none is running
    fn wait_for_background(self: &Arc<Self>, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        if state.bg_running {
            self.bg_cv.wait(state);
            return Ok(());
        }
        self.run_exclusive(state, |state: &mut MutexGuard<'_, DbState>| self.background_compaction(state))
    }

    /// Run `work` as the only flush/compaction job
    fn run_exclusive<R>(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        work: impl FnOnce(&mut MutexGuard<'_, DbState>) -> Result<R>,
    ) -> Result<R> {
        while state.bg_running {
            self.bg_cv.wait(state);
        }
        state.bg_running = true;
        let result = work(state);
        state.bg_running = false;
        state.pending_outputs.clear();
        self.bg_cv.notify_all();
        result
    }

    fn maybe_schedule_compaction(self: &Arc<Self>, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_scheduled || self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let has_imm = self.view.read().imm.is_some();
        if !has_imm && !state.versions.needs_compaction() {
            return;
        }

        state.bg_scheduled = true;
        let db = Arc::downgrade(self);
        let job = Box::new(move || {
            if let Some(db) = db.upgrade() {
                db.background_call();
            }
        });
        // The environment may run the job inline
        MutexGuard::unlocked(state, || self.env.schedule(job));
    }

    fn background_call(self: &Arc<Self>) {
        self.log_scope(|| {
            let mut state = self.state.lock();
            while state.bg_running && !self.shutting_down.load(Ordering::Acquire) {
                self.bg_cv.wait(&mut state);
            }
            if self.shutting_down.load(Ordering::Acquire) {
                state.bg_scheduled = false;
                self.bg_cv.notify_all();
                return;
            }

            let result = self.run_exclusive(&mut state, |state: &mut MutexGuard<'_, DbState>| {
                self.background_compaction(state)
            });
            state.bg_scheduled = false;
            match result {
                // The finished work may have pushed another level over its limit
                Ok(()) => self.maybe_schedule_compaction(&mut state),
                // Retried on the next trigger
                Err(e) if self.shutting_down.load(Ordering::Acquire) => {
                    debug!("Background work stopped by close: {}", e)
                }
                Err(e) => error!("Background work failed: {}", e),
            }
            self.bg_cv.notify_all();
        });
    }

    fn background_compaction(self: &Arc<Self>, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        if self.view.read().imm.is_some() {
            return self.compact_memtable(state);
        }
        match select_compaction(&state.versions, self.options.max_file_size as u64) {
            Some(task) => self.run_task(state, task, true),
            None => Ok(()),
        }
    }

    /// Write the frozen memtable to a level-0 table
    fn compact_memtable(self: &Arc<Self>, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let Some(imm) = self.view.read().imm.clone() else {
            return Ok(());
        };

        let start = Instant::now();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let built = MutexGuard::unlocked(state, || {
            build_table(&self.dbname, &self.options, &self.icmp, &mut imm.iter(), number)
        })?;

        let mut edit = VersionEdit::new();
        let mut stats = LevelStats::default();
        if let Some(meta) = built {
            info!(
                "Level-0 table #{} from log #{}: {} entries, {} bytes",
                meta.number,
                imm.log_number(),
                imm.len(),
                meta.file_size
            );
            stats.bytes_written = meta.file_size;
            edit.add_file(0, meta);
        }
        // Older logs are covered by the new table
        edit.set_log_number(state.log_number);
        state.versions.log_and_apply(&mut edit)?;

        stats.micros = start.elapsed().as_micros() as u64;
        state.stats[0].add(&stats);
        {
            let mut view = self.view.write();
            view.imm = None;
            view.version = state.versions.current();
        }
        self.delete_obsolete_files(state);
        Ok(())
    }

    fn run_task(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        mut task: CompactionTask,
        allow_trivial_move: bool,
    ) -> Result<()> {
        let level = task.level();
        if allow_trivial_move && task.is_trivial_move() {
            let file = task.inputs(0)[0].clone();
            task.edit.delete_file(level, file.number);
            task.edit.add_file(level + 1, (*file).clone());
            state.versions.log_and_apply(&mut task.edit)?;
            info!(
                "Moved #{} to level-{} ({} bytes): {}",
                file.number,
                level + 1,
                file.file_size,
                state.versions.current().level_summary()
            );
        } else {
            let smallest_snapshot = self
                .snapshots
                .oldest()
                .unwrap_or_else(|| state.versions.last_sequence());
            let input = task.input_iterator(&self.table_cache, self.options.paranoid_checks);
            let allocate = || {
                let mut state = self.state.lock();
                let number = state.versions.new_file_number();
                state.pending_outputs.insert(number);
                number
            };
            let ctx = CompactionContext {
                dbname: &self.dbname,
                options: &self.options,
                icmp: &self.icmp,
                smallest_snapshot,
                allocate_file_number: &allocate,
                shutting_down: &self.shutting_down,
            };
            let (outputs, stats) = MutexGuard::unlocked(state, || run_compaction(&task, input, &ctx))?;

            task.add_input_deletions();
            for file in outputs {
                task.edit.add_file(level + 1, file);
            }
            // Outputs of a failed install are unreferenced and removed below
            let installed = state.versions.log_and_apply(&mut task.edit);
            if installed.is_ok() {
                state.stats[level + 1].add(&stats);
            }
            state.pending_outputs.clear();
            if let Err(e) = installed {
                self.delete_obsolete_files(state);
                return Err(e);
            }
        }

        self.view.write().version = state.versions.current();
        self.delete_obsolete_files(state);
        Ok(())
    }

    /// Remove files no live version, pending output or current log needs
    fn delete_obsolete_files(&self, state: &mut DbState) {
        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let names = match self.env.children(&self.dbname) {
            Ok(names) => names,
            Err(e) => {
                warn!("Cannot list {}: {}", self.dbname.display(), e);
                return;
            }
        };

        let log_number = state.versions.log_number();
        let manifest_number = state.versions.manifest_file_number();
        for name in names {
            let Some((kind, number)) = parse_file_name(&name) else {
                continue;
            };
            let keep = match kind {
                FileType::Log => number >= log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table | FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock => true,
            };
            if keep {
                continue;
            }
            if kind == FileType::Table {
                self.table_cache.evict(number);
            }
            debug!("Deleting obsolete file {}", name);
            if let Err(e) = self.env.remove_file(&self.dbname.join(&name)) {
                warn!("Failed to delete {}: {}", name, e);
            }
        }
    }

    fn read_view(&self, options: &ReadOptions) -> (Arc<MemTable>, Option<Arc<MemTable>>, Arc<Version>, SequenceNumber) {
        let view = self.view.read();
        let sequence = options
            .snapshot
            .as_ref()
            .map_or(view.last_sequence, Snapshot::sequence);
        (view.mem.clone(), view.imm.clone(), view.version.clone(), sequence)
    }

    fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let (mem, imm, version, sequence) = self.read_view(options);
        let lkey = LookupKey::new(key, sequence);

        let found = match mem.get(&lkey).or_else(|| imm.as_ref().and_then(|imm| imm.get(&lkey))) {
            Some(result) => Some(result),
            None => version.get(options, &lkey, &self.table_cache)?,
        };
        Ok(match found {
            Some(LookupResult::Found(value)) => Some(value.to_vec()),
            Some(LookupResult::Deleted) | None => None,
        })
    }

    fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        self.check_open()?;
        let (mem, imm, version, sequence) = self.read_view(options);

        let mut iters: Vec<Box<dyn InternalIterator>> = vec![Box::new(mem.iter())];
        if let Some(imm) = imm {
            iters.push(Box::new(imm.iter()));
        }
        version.add_iterators(options, &self.table_cache, &mut iters);
        let merged = MergingIterator::new(self.icmp.clone(), iters);
        Ok(DbIterator::new(
            Box::new(merged),
            self.icmp.user_comparator().clone(),
            sequence,
            version,
            options.snapshot.clone(),
        ))
    }

    fn flush(self: &Arc<Self>) -> Result<()> {
        self.check_open()?;
        let mut writer = self.writer.lock();
        if writer.log.is_none() {
            return Err(TideError::Closed);
        }

        let mut state = self.state.lock();
        let result = self.run_exclusive(&mut state, |state: &mut MutexGuard<'_, DbState>| {
            // A memtable already frozen goes first
            self.compact_memtable(state)?;
            if !self.view.read().mem.is_empty() {
                self.switch_memtable(&mut writer, state)?;
                self.compact_memtable(state)?;
            }
            Ok(())
        });
        self.maybe_schedule_compaction(&mut state);
        result
    }

    fn compact_range(self: &Arc<Self>, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.check_open()?;
        let max_level_with_files = {
            let version = self.view.read().version.clone();
            (1..NUM_LEVELS)
                .filter(|&level| version.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };
        self.flush()?;

        let max_file_size = self.options.max_file_size as u64;
        for level in 0..max_level_with_files {
            loop {
                self.check_open()?;
                let mut state = self.state.lock();
                let done = self.run_exclusive(&mut state, |state: &mut MutexGuard<'_, DbState>| {
                    match range_compaction(&state.versions, level, begin, end, max_file_size) {
                        Some(task) => self.run_task(state, task, false).map(|_| false),
                        None => Ok(true),
                    }
                })?;
                if done {
                    break;
                }
            }
        }
        info!("Manual compaction done: {}", self.view.read().version.level_summary());
        Ok(())
    }

    fn property(&self, name: &str) -> Option<String> {
        if self.check_open().is_err() {
            return None;
        }
        let name = name.strip_prefix("tidedb.")?;

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(self.view.read().version.num_files(level).to_string());
        }

        match name {
            "stats" => {
                let state = self.state.lock();
                let version = state.versions.current();
                let mut out = String::new();
                let _ = writeln!(out, "                               Compactions");
                let _ = writeln!(out, "Level  Files Size(MB) Time(sec) Read(MB) Write(MB)");
                let _ = writeln!(out, "--------------------------------------------------");
                for level in 0..NUM_LEVELS {
                    let stats = &state.stats[level];
                    let files = version.num_files(level);
                    if files == 0 && stats.micros == 0 {
                        continue;
                    }
                    let _ = writeln!(
                        out,
                        "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}",
                        level,
                        files,
                        version.level_bytes(level) as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0
                    );
                }
                Some(out)
            }
            "sstables" => Some(self.view.read().version.debug_string()),
            "approximate-memory-usage" => {
                let view = self.view.read();
                let mut total = view.mem.approximate_memory_usage();
                if let Some(imm) = &view.imm {
                    total += imm.approximate_memory_usage();
                }
                if let Some(cache) = &self.options.block_cache {
                    total += cache.usage();
                }
                Some(total.to_string())
            }
            "last-sequence" => Some(self.view.read().last_sequence.to_string()),
            _ => None,
        }
    }
}

/// Replay every log newer than the manifest's log number into level-0 tables
fn recover_logs(
    dbname: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    env: &dyn Env,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
) -> Result<()> {
    let mut expected = versions.live_files();
    let mut logs = Vec::new();
    for name in env.children(dbname)? {
        match parse_file_name(&name) {
            Some((FileType::Table, number)) => {
                expected.remove(&number);
            }
            Some((FileType::Log, number)) if number >= versions.log_number() => logs.push(number),
            _ => {}
        }
    }
    if !expected.is_empty() {
        let mut missing: Vec<u64> = expected.into_iter().collect();
        missing.sort_unstable();
        return Err(TideError::Corruption(format!(
            "{} missing table files, e.g. {}",
            missing.len(),
            table_file_name(dbname, missing[0]).display()
        )));
    }

    logs.sort_unstable();
    let mut max_sequence = versions.last_sequence();
    for number in logs {
        versions.mark_file_number_used(number);
        replay_log(dbname, options, icmp, versions, number, edit, &mut max_sequence)?;
    }
    versions.set_last_sequence(max_sequence);
    Ok(())
}

fn replay_log(
    dbname: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    versions: &mut VersionSet,
    number: u64,
    edit: &mut VersionEdit,
    max_sequence: &mut SequenceNumber,
) -> Result<()> {
    let path = log_file_name(dbname, number);
    let mode = if options.paranoid_checks {
        ReadMode::Paranoid
    } else {
        ReadMode::Tolerant
    };
    let mut reader = LogReader::open(&path, mode)?;
    let mut mem: Option<Arc<MemTable>> = None;
    let mut batches = 0usize;

    while let Some(record) = reader.next_record()? {
        let batch = match WriteBatch::from_contents(&record).and_then(|b| b.validate().map(|_| b)) {
            Ok(batch) => batch,
            Err(e) if options.paranoid_checks => return Err(e),
            Err(e) => {
                warn!("Skipping bad batch in {}: {}", path.display(), e);
                continue;
            }
        };

        let table: &MemTable = mem.get_or_insert_with(|| Arc::new(MemTable::new(icmp.clone(), number)));
        batch.iterate(&mut MemTableInserter {
            sequence: batch.sequence(),
            mem: table,
        })?;
        batches += 1;
        if batch.count() > 0 {
            let last = batch.sequence() + u64::from(batch.count()) - 1;
            *max_sequence = (*max_sequence).max(last);
        }

        if table.approximate_memory_usage() > options.write_buffer_size {
            if let Some(full) = mem.take() {
                write_level0_table(dbname, options, icmp, versions, &full, edit)?;
            }
        }
    }
    if reader.dropped_bytes() > 0 {
        warn!("Dropped {} bytes from the tail of {}", reader.dropped_bytes(), path.display());
    }
    if let Some(mem) = mem {
        write_level0_table(dbname, options, icmp, versions, &mem, edit)?;
    }
    info!("Recovered log #{}: {} batches", number, batches);
    Ok(())
}

fn write_level0_table(
    dbname: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    versions: &mut VersionSet,
    mem: &Arc<MemTable>,
    edit: &mut VersionEdit,
) -> Result<()> {
    let number = versions.new_file_number();
    match build_table(dbname, options, icmp, &mut mem.iter(), number)? {
        Some(meta) => {
            info!("Level-0 table #{}: {} bytes (recovered)", meta.number, meta.file_size);
            edit.add_file(0, meta);
        }
        None => versions.reuse_file_number(number),
    }
    Ok(())
}

/// Delete every file of the database at `path`.
///
/// A missing directory is not an error. Fails if the database is open.
pub fn destroy_database(path: impl AsRef<Path>, options: &Options) -> Result<()> {
    let dbname = path.as_ref();
    let env = options.env.clone();
    let names = match env.children(dbname) {
        Ok(names) => names,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    let lock_path = lock_file_name(dbname);
    let lock = env.lock_file(&lock_path)?;
    let mut result = Ok(());
    for name in names {
        match parse_file_name(&name) {
            Some((FileType::Lock, _)) | None => {}
            Some(_) => {
                if let Err(e) = env.remove_file(&dbname.join(&name)) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
    }
    drop(lock);
    let _ = env.remove_file(&lock_path);
    // Leaves the directory in place when foreign files remain
    let _ = env.remove_dir(dbname);
    info!("Destroyed {}", dbname.display());
    result
}
