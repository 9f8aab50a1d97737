//! Leveled compaction for the LSM tree
//!
//! Level 0 is compacted once it holds `L0_COMPACTION_TRIGGER` files; deeper
//! levels once their total size exceeds `max_bytes_for_level`. A compaction
//! merges a set of files from level `L` with every overlapping file of level
//! `L + 1` and writes the result into `L + 1`.

use crate::cache::TableCache;
use crate::config::{LEVEL_SIZE_RATIO, MAX_BYTES_FOR_LEVEL_BASE, NUM_LEVELS};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::options::{Options, ReadOptions};
use crate::sstable::TableBuilder;
use crate::types::{parse_internal_key, InternalKeyComparator, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER};
use crate::version::edit::{FileMetaData, VersionEdit};
use crate::version::filename::table_file_name;
use crate::version::version::level_concat_iter;
use crate::version::{Version, VersionSet};
use crate::{Result, TideError};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Maximum total bytes for a sorted level
pub fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = MAX_BYTES_FOR_LEVEL_BASE as f64;
    for _ in 1..level {
        result *= LEVEL_SIZE_RATIO as f64;
    }
    result
}

/// Per-level compaction statistics, reported by the `tidedb.stats` property
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl LevelStats {
    pub fn add(&mut self, other: &LevelStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// Files chosen for one compaction
#[derive(Debug)]
pub struct CompactionTask {
    level: usize,
    /// `inputs[0]` from `level`, `inputs[1]` from `level + 1`
    inputs: [Vec<Arc<FileMetaData>>; 2],
    input_version: Arc<Version>,
    max_output_file_size: u64,
    /// Edit carrying the compact pointer; filled with inputs and outputs on install
    pub edit: VersionEdit,
}

impl CompactionTask {
    fn new(level: usize, version: Arc<Version>, max_output_file_size: u64) -> Self {
        Self {
            level,
            inputs: [Vec::new(), Vec::new()],
            input_version: version,
            max_output_file_size,
            edit: VersionEdit::new(),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
        &self.inputs[which]
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().flatten().map(|f| f.file_size).sum()
    }

    /// A single file with nothing to merge against can simply move down a level
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1 && self.inputs[1].is_empty()
    }

    /// Record the removal of every input file in the edit
    pub fn add_input_deletions(&mut self) {
        for (which, files) in self.inputs.iter().enumerate() {
            for file in files {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True when no level below the output level can contain `user_key`,
    /// so a tombstone for it has nothing left to shadow.
    pub fn is_base_level_for_key(&self, user_key: &[u8]) -> bool {
        let icmp = self.input_version.comparator();
        for level in self.level + 2..NUM_LEVELS {
            for file in self.input_version.files(level) {
                if icmp.compare_user(user_key, file.smallest_user_key()) != Ordering::Less
                    && icmp.compare_user(user_key, file.largest_user_key()) != Ordering::Greater
                {
                    return false;
                }
            }
        }
        true
    }

    /// Merged view over every input file
    pub fn input_iterator(&self, table_cache: &Arc<TableCache>, paranoid_checks: bool) -> Box<dyn InternalIterator> {
        let mut options = ReadOptions::default();
        options.verify_checksums = paranoid_checks;
        options.fill_cache = false;

        let icmp = self.input_version.comparator().clone();
        let mut iters: Vec<Box<dyn InternalIterator>> = Vec::new();
        for (which, files) in self.inputs.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            if self.level + which == 0 {
                for file in files {
                    iters.push(table_cache.iter(&options, file.number, file.file_size));
                }
            } else {
                iters.push(level_concat_iter(files.clone(), icmp.clone(), &options, table_cache));
            }
        }
        Box::new(MergingIterator::new(icmp, iters))
    }

    fn key_range(&self, files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
        let icmp = self.input_version.comparator();
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if icmp.compare(&file.smallest, &smallest) == Ordering::Less {
                smallest = file.smallest.clone();
            }
            if icmp.compare(&file.largest, &largest) == Ordering::Greater {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn setup_other_inputs(&mut self) {
        let (smallest, largest) = self.key_range(&self.inputs[0]);
        let smallest_user = crate::types::extract_user_key(&smallest);
        let largest_user = crate::types::extract_user_key(&largest);
        self.inputs[1] = self
            .input_version
            .overlapping_inputs(self.level + 1, Some(smallest_user), Some(largest_user));

        // Next compaction of this level starts after this range
        self.edit.set_compact_pointer(self.level, &largest);
    }
}

/// Pick the compaction the current version needs most, if any
pub fn select_compaction(vset: &VersionSet, max_file_size: u64) -> Option<CompactionTask> {
    let version = vset.current();
    if version.compaction_score < 1.0 {
        return None;
    }
    let level = version.compaction_level;
    debug_assert!(level + 1 < NUM_LEVELS);

    let first = pick_file_to_compact(vset, &version, level)?;
    let mut task = CompactionTask::new(level, version.clone(), max_file_size);

    if level == 0 {
        // Overlapping L0 files must move together
        task.inputs[0] = find_overlapping(&version, 0, &first);
    } else {
        task.inputs[0] = vec![first];
    }
    task.setup_other_inputs();
    Some(task)
}

/// First file after the level's compact pointer, wrapping around
fn pick_file_to_compact(vset: &VersionSet, version: &Version, level: usize) -> Option<Arc<FileMetaData>> {
    let files = version.files(level);
    let pointer = vset.compact_pointer(level);
    let icmp = vset.comparator();
    files
        .iter()
        .find(|f| pointer.is_empty() || icmp.compare(&f.largest, pointer) == Ordering::Greater)
        .or_else(|| files.first())
        .cloned()
}

fn find_overlapping(version: &Version, level: usize, file: &FileMetaData) -> Vec<Arc<FileMetaData>> {
    version.overlapping_inputs(level, Some(file.smallest_user_key()), Some(file.largest_user_key()))
}

/// Compaction of `level` restricted to the user key range `[begin, end]`
pub fn range_compaction(
    vset: &VersionSet,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
    max_file_size: u64,
) -> Option<CompactionTask> {
    let version = vset.current();
    let mut inputs = version.overlapping_inputs(level, begin, end);
    if inputs.is_empty() {
        return None;
    }

    // Bound the work done in one step for sorted levels
    if level > 0 {
        let mut total = 0;
        for i in 0..inputs.len() {
            total += inputs[i].file_size;
            if total >= max_file_size {
                inputs.truncate(i + 1);
                break;
            }
        }
    }

    let mut task = CompactionTask::new(level, version, max_file_size);
    task.inputs[0] = inputs;
    task.setup_other_inputs();
    Some(task)
}

/// What a compaction needs from the database while it runs unlocked
pub struct CompactionContext<'a> {
    pub dbname: &'a Path,
    pub options: &'a Options,
    pub icmp: &'a InternalKeyComparator,
    /// Entries hidden from every snapshot at or below this sequence may be dropped
    pub smallest_snapshot: SequenceNumber,
    /// Allocates (and protects from deletion) a number for a new output file
    pub allocate_file_number: &'a dyn Fn() -> u64,
    pub shutting_down: &'a AtomicBool,
}

struct OutputState {
    builder: TableBuilder,
    number: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

/// Merge the task's inputs into new tables for level `level + 1`.
///
/// On failure every output written so far is deleted and the inputs are
/// left untouched.
pub fn run_compaction(
    task: &CompactionTask,
    mut input: Box<dyn InternalIterator>,
    ctx: &CompactionContext<'_>,
) -> Result<(Vec<FileMetaData>, LevelStats)> {
    let start = Instant::now();
    info!(
        "Compacting {}@{} + {}@{} files",
        task.inputs[0].len(),
        task.level,
        task.inputs[1].len(),
        task.level + 1
    );

    let mut outputs = Vec::new();
    let mut current = None;
    let merged = merge_into_outputs(task, input.as_mut(), ctx, &mut outputs, &mut current);

    if let Err(e) = merged {
        warn!("Compaction failed: {}", e);
        let numbers = outputs
            .iter()
            .map(|f: &FileMetaData| f.number)
            .chain(current.map(|c: OutputState| c.number));
        for number in numbers {
            let _ = std::fs::remove_file(table_file_name(ctx.dbname, number));
        }
        return Err(e);
    }

    let stats = LevelStats {
        micros: start.elapsed().as_micros() as u64,
        bytes_read: task.input_bytes(),
        bytes_written: outputs.iter().map(|f| f.file_size).sum(),
    };
    info!(
        "Compacted to {} files ({} bytes) in {}ms",
        outputs.len(),
        stats.bytes_written,
        stats.micros / 1000
    );
    Ok((outputs, stats))
}

fn merge_into_outputs(
    task: &CompactionTask,
    input: &mut dyn InternalIterator,
    ctx: &CompactionContext<'_>,
    outputs: &mut Vec<FileMetaData>,
    current: &mut Option<OutputState>,
) -> Result<()> {
    let mut current_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;
    let mut dropped = 0u64;

    input.seek_to_first();
    while input.valid() {
        if ctx.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(TideError::Internal("database closed during compaction".into()));
        }

        let key = input.key();
        let mut drop = false;
        let mut new_user_key = false;
        match parse_internal_key(key) {
            None => {
                // Keep unparsable keys rather than silently losing data
                current_user_key = None;
                last_sequence_for_key = MAX_SEQUENCE_NUMBER;
            }
            Some(ikey) => {
                let same = current_user_key
                    .as_deref()
                    .is_some_and(|k| ctx.icmp.compare_user(ikey.user_key, k) == Ordering::Equal);
                if !same {
                    current_user_key = Some(ikey.user_key.to_vec());
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    new_user_key = true;
                }

                if last_sequence_for_key <= ctx.smallest_snapshot {
                    // Shadowed by a newer entry that every snapshot can see
                    drop = true;
                } else if ikey.value_type == ValueType::Deletion
                    && ikey.sequence <= ctx.smallest_snapshot
                    && task.is_base_level_for_key(ikey.user_key)
                {
                    drop = true;
                }
                last_sequence_for_key = ikey.sequence;
            }
        }

        if drop {
            dropped += 1;
        } else {
            // Outputs are only split between user keys so sorted levels stay disjoint
            let full = current
                .as_ref()
                .is_some_and(|out| out.builder.file_size() >= task.max_output_file_size);
            if full && new_user_key {
                finish_output(current, outputs)?;
            }

            if current.is_none() {
                let number = (ctx.allocate_file_number)();
                let builder = TableBuilder::create(table_file_name(ctx.dbname, number), ctx.options, ctx.icmp.clone())?;
                *current = Some(OutputState {
                    builder,
                    number,
                    smallest: key.to_vec(),
                    largest: Vec::new(),
                });
            }
            if let Some(out) = current.as_mut() {
                out.largest.clear();
                out.largest.extend_from_slice(key);
                out.builder.add(key, input.value())?;
            }
        }

        input.next();
    }

    input.status()?;
    finish_output(current, outputs)?;
    debug!("Compaction dropped {} obsolete entries", dropped);
    Ok(())
}

fn finish_output(current: &mut Option<OutputState>, outputs: &mut Vec<FileMetaData>) -> Result<()> {
    let Some(OutputState {
        builder,
        number,
        smallest,
        largest,
    }) = current.take()
    else {
        return Ok(());
    };

    // Record the output even on failure so the cleanup path removes the file
    let finished = builder.finish();
    outputs.push(FileMetaData {
        number,
        file_size: *finished.as_ref().unwrap_or(&0),
        smallest,
        largest,
    });
    finished.map(|_| ())
}

/// Write every entry of `iter` into table `number`.
///
/// Returns `None` (and leaves no file behind) when the iterator is empty.
pub fn build_table(
    dbname: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    iter: &mut dyn InternalIterator,
    number: u64,
) -> Result<Option<FileMetaData>> {
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Ok(None);
    }

    let path = table_file_name(dbname, number);
    let written = (|| -> Result<FileMetaData> {
        let mut builder = TableBuilder::create(&path, options, icmp.clone())?;
        let smallest = iter.key().to_vec();
        let mut largest = Vec::new();
        while iter.valid() {
            largest.clear();
            largest.extend_from_slice(iter.key());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;
        let file_size = builder.finish()?;
        Ok(FileMetaData {
            number,
            file_size,
            smallest,
            largest,
        })
    })();

    match written {
        Ok(meta) => Ok(Some(meta)),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::types::{BytewiseComparator, InternalKey};
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    struct Fixture {
        dir: TempDir,
        options: Options,
        table_cache: Arc<TableCache>,
        vset: VersionSet,
        shutting_down: AtomicBool,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let table_cache = Arc::new(TableCache::new(dir.path(), icmp(), None, 100));
            let vset = VersionSet::new(dir.path(), icmp(), table_cache.clone(), false);
            Self {
                dir,
                options: Options::default(),
                table_cache,
                vset,
                shutting_down: AtomicBool::new(false),
            }
        }

        /// Flush `entries` into a new level-`level` table
        fn add_table(&mut self, level: usize, entries: &[(&str, u64, ValueType)]) -> u64 {
            let mem = Arc::new(MemTable::new(icmp(), 0));
            for (key, seq, vt) in entries {
                mem.add(*seq, *vt, key.as_bytes(), format!("{}@{}", key, seq).as_bytes());
            }
            let number = self.vset.new_file_number();
            let meta = build_table(self.dir.path(), &self.options, &icmp(), &mut mem.iter(), number)
                .unwrap()
                .unwrap();
            let mut edit = VersionEdit::new();
            edit.add_file(level, meta);
            self.vset.log_and_apply(&mut edit).unwrap();
            number
        }

        fn run(&mut self, mut task: CompactionTask, smallest_snapshot: SequenceNumber) -> Vec<(Vec<u8>, u64, ValueType)> {
            let next = AtomicU64::new(self.vset.next_file_number() + 100);
            let allocate = || next.fetch_add(1, AtomicOrdering::Relaxed);
            let ctx = CompactionContext {
                dbname: self.dir.path(),
                options: &self.options,
                icmp: &icmp(),
                smallest_snapshot,
                allocate_file_number: &allocate,
                shutting_down: &self.shutting_down,
            };
            let input = task.input_iterator(&self.table_cache, true);
            let (outputs, stats) = run_compaction(&task, input, &ctx).unwrap();
            assert_eq!(stats.bytes_read, task.input_bytes());

            task.add_input_deletions();
            for file in outputs {
                self.vset.mark_file_number_used(file.number);
                task.edit.add_file(task.level() + 1, file);
            }
            self.vset.log_and_apply(&mut task.edit).unwrap();
            self.contents()
        }

        fn contents(&self) -> Vec<(Vec<u8>, u64, ValueType)> {
            let mut iters = Vec::new();
            self.vset
                .current()
                .add_iterators(&ReadOptions::default(), &self.table_cache, &mut iters);
            let mut merged = MergingIterator::new(icmp(), iters);
            merged.seek_to_first();
            let mut out = Vec::new();
            while merged.valid() {
                let k = parse_internal_key(merged.key()).unwrap();
                out.push((k.user_key.to_vec(), k.sequence, k.value_type));
                merged.next();
            }
            out
        }
    }

    #[test]
    fn test_max_bytes_for_level() {
        assert_eq!(max_bytes_for_level(1), 10.0 * 1024.0 * 1024.0);
        assert_eq!(max_bytes_for_level(3), 1000.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn test_level0_compaction_collapses_versions() {
        let mut fx = Fixture::new();
        fx.add_table(0, &[("a", 1, ValueType::Value), ("b", 2, ValueType::Value)]);
        fx.add_table(0, &[("a", 3, ValueType::Value), ("c", 4, ValueType::Value)]);
        fx.add_table(0, &[("b", 5, ValueType::Deletion)]);
        fx.add_table(0, &[("d", 6, ValueType::Value)]);

        assert!(fx.vset.needs_compaction());
        let task = select_compaction(&fx.vset, 1 << 20).unwrap();
        assert_eq!(task.level(), 0);
        // d@6 does not overlap the others and stays behind
        assert_eq!(task.inputs(0).len(), 3);
        assert!(!task.is_trivial_move());

        let contents = fx.run(task, 100);
        assert_eq!(
            contents,
            vec![
                (b"a".to_vec(), 3, ValueType::Value),
                (b"c".to_vec(), 4, ValueType::Value),
                (b"d".to_vec(), 6, ValueType::Value),
            ]
        );
        assert_eq!(fx.vset.current().level_summary(), "files[ 1 1 0 0 0 0 0 ]");
    }

    #[test]
    fn test_snapshot_keeps_visible_versions() {
        let mut fx = Fixture::new();
        fx.add_table(0, &[("a", 1, ValueType::Value)]);
        fx.add_table(0, &[("a", 5, ValueType::Value)]);
        fx.add_table(0, &[("a", 9, ValueType::Deletion)]);

        // A snapshot at 6 still needs a@5; a@1 is hidden from it
        let task = range_compaction(&fx.vset, 0, None, None, 1 << 20).unwrap();
        let contents = fx.run(task, 6);
        assert_eq!(
            contents,
            vec![
                (b"a".to_vec(), 9, ValueType::Deletion),
                (b"a".to_vec(), 5, ValueType::Value),
            ]
        );
    }

    #[test]
    fn test_tombstone_kept_while_deeper_level_has_key() {
        let mut fx = Fixture::new();
        fx.add_table(3, &[("k", 1, ValueType::Value)]);
        fx.add_table(0, &[("k", 7, ValueType::Deletion)]);

        let task = range_compaction(&fx.vset, 0, None, None, 1 << 20).unwrap();
        assert!(!task.is_base_level_for_key(b"k"));
        assert!(task.is_base_level_for_key(b"z"));
        let contents = fx.run(task, 100);
        assert_eq!(
            contents,
            vec![
                (b"k".to_vec(), 7, ValueType::Deletion),
                (b"k".to_vec(), 1, ValueType::Value),
            ]
        );
    }

    #[test]
    fn test_outputs_split_between_user_keys() {
        let mut fx = Fixture::new();
        fx.options.block_size = 256;
        let entries: Vec<(String, u64)> = (0..200).map(|i| (format!("key{:04}", i), i as u64 + 1)).collect();
        let borrowed: Vec<(&str, u64, ValueType)> =
            entries.iter().map(|(k, s)| (k.as_str(), *s, ValueType::Value)).collect();
        fx.add_table(0, &borrowed);

        let mut task = range_compaction(&fx.vset, 0, None, None, 1024).unwrap();
        task.max_output_file_size = 1024;
        let contents = fx.run(task, 1000);
        assert_eq!(contents.len(), 200);
        assert!(fx.vset.current().num_files(1) > 1);
    }

    #[test]
    fn test_trivial_move_detection() {
        let mut fx = Fixture::new();
        fx.add_table(0, &[("a", 1, ValueType::Value)]);
        fx.add_table(1, &[("x", 2, ValueType::Value)]);
        let task = range_compaction(&fx.vset, 0, None, None, 1 << 20).unwrap();
        assert!(task.is_trivial_move());
    }

    #[test]
    fn test_shutdown_aborts_and_removes_outputs() {
        let mut fx = Fixture::new();
        fx.add_table(0, &[("a", 1, ValueType::Value), ("b", 2, ValueType::Value)]);
        fx.add_table(0, &[("c", 3, ValueType::Value)]);
        fx.shutting_down.store(true, AtomicOrdering::Release);

        let task = range_compaction(&fx.vset, 0, None, None, 1 << 20).unwrap();
        let next = AtomicU64::new(500);
        let allocate = || next.fetch_add(1, AtomicOrdering::Relaxed);
        let ctx = CompactionContext {
            dbname: fx.dir.path(),
            options: &fx.options,
            icmp: &icmp(),
            smallest_snapshot: 100,
            allocate_file_number: &allocate,
            shutting_down: &fx.shutting_down,
        };
        let input = task.input_iterator(&fx.table_cache, false);
        assert!(run_compaction(&task, input, &ctx).is_err());
        assert!(!table_file_name(fx.dir.path(), 500).exists());
        assert_eq!(fx.vset.current().num_files(0), 2);
    }

    #[test]
    fn test_build_table_skips_empty_input() {
        let fx = Fixture::new();
        let mem = Arc::new(MemTable::new(icmp(), 0));
        let result = build_table(fx.dir.path(), &fx.options, &icmp(), &mut mem.iter(), 9).unwrap();
        assert!(result.is_none());
        assert!(!table_file_name(fx.dir.path(), 9).exists());

        let key = InternalKey::new(b"k", 1, ValueType::Value);
        mem.add(1, ValueType::Value, b"k", b"v");
        let meta = build_table(fx.dir.path(), &fx.options, &icmp(), &mut mem.iter(), 9)
            .unwrap()
            .unwrap();
        assert_eq!(meta.smallest, key.encode());
        assert_eq!(meta.largest, key.encode());
    }
}
