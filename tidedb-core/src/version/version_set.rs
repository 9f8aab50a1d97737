//! The sequence of versions and the manifest that persists it

use super::edit::VersionEdit;
use super::filename::{descriptor_file_name, read_current_file, set_current_file};
use super::version::Version;
use crate::cache::TableCache;
use crate::compaction::max_bytes_for_level;
use crate::config::{L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::types::{InternalKeyComparator, SequenceNumber};
use crate::wal::{LogReader, LogWriter, ReadMode};
use crate::{Result, TideError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Owns the current version, file number allocation and the manifest.
///
/// Guarded by the database mutex; every method expects exclusive access.
pub struct VersionSet {
    dbname: PathBuf,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    paranoid_checks: bool,
    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    current: Arc<Version>,
    /// Versions still pinned by readers; their files must not be deleted
    live: Vec<Weak<Version>>,
    manifest: Option<LogWriter>,
    compact_pointers: Vec<Vec<u8>>,
}

impl VersionSet {
    pub fn new(
        dbname: impl Into<PathBuf>,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        paranoid_checks: bool,
    ) -> Self {
        Self {
            dbname: dbname.into(),
            current: Arc::new(Version::new(icmp.clone())),
            icmp,
            table_cache,
            paranoid_checks,
            next_file_number: 1,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            live: Vec::new(),
            manifest: None,
            compact_pointers: vec![Vec::new(); NUM_LEVELS],
        }
    }

    /// Load the state recorded by `CURRENT` and its manifest.
    ///
    /// The next `log_and_apply` starts a fresh manifest.
    pub fn recover(&mut self) -> Result<()> {
        let current = read_current_file(&self.dbname)?;
        let path = self.dbname.join(&current);
        let mode = if self.paranoid_checks {
            ReadMode::Paranoid
        } else {
            ReadMode::Tolerant
        };
        let mut reader = LogReader::open(&path, mode).map_err(|e| match e {
            TideError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                TideError::Corruption(format!("CURRENT points to missing manifest {}", current))
            }
            other => other,
        })?;

        let mut version = Version::new(self.icmp.clone());
        let mut log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut records = 0;

        while let Some(record) = reader.next_record()? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator {
                let expected = self.icmp.user_comparator().name();
                if name != expected {
                    return Err(TideError::InvalidArgument(format!(
                        "comparator {} does not match existing comparator {}",
                        expected, name
                    )));
                }
            }
            version = version.apply(&edit)?;
            for (level, key) in &edit.compact_pointers {
                if *level < NUM_LEVELS {
                    self.compact_pointers[*level] = key.clone();
                }
            }
            log_number = edit.log_number.or(log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
            records += 1;
        }

        let missing = |what: &str| TideError::Corruption(format!("{} missing from manifest {}", what, current));
        let next_file_number = next_file_number.ok_or_else(|| missing("next file number"))?;
        let log_number = log_number.ok_or_else(|| missing("log number"))?;
        let last_sequence = last_sequence.ok_or_else(|| missing("last sequence"))?;

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.log_number = log_number;
        self.last_sequence = last_sequence;
        self.manifest = None;
        self.install(version);

        info!(
            "Recovered {} ({} records): {}, last sequence {}, log #{}",
            current,
            records,
            self.current.level_summary(),
            last_sequence,
            log_number
        );
        Ok(())
    }

    /// Persist `edit` to the manifest and make the resulting version current.
    ///
    /// Fills in the log number (when unset), next file number and last sequence.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(number) => debug_assert!(number >= self.log_number && number < self.next_file_number),
            None => edit.set_log_number(self.log_number),
        }

        let mut created = None;
        if self.manifest.is_none() {
            let number = self.new_file_number();
            let path = descriptor_file_name(&self.dbname, number);
            let mut writer = LogWriter::create(&path)?;
            let snapshot = self.snapshot_edit();
            if let Err(e) = writer.add_record(&snapshot.encode()?, false) {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
            self.manifest_file_number = number;
            self.manifest = Some(writer);
            created = Some(path);
        }

        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let applied = self.current.apply(edit).and_then(|version| {
            let record = edit.encode()?;
            if let Some(manifest) = self.manifest.as_mut() {
                manifest.add_record(&record, true)?;
            }
            if created.is_some() {
                set_current_file(&self.dbname, self.manifest_file_number)?;
            }
            Ok(version)
        });

        match applied {
            Ok(version) => {
                if let Some(number) = edit.log_number {
                    self.log_number = number;
                }
                for (level, key) in &edit.compact_pointers {
                    if *level < NUM_LEVELS {
                        self.compact_pointers[*level] = key.clone();
                    }
                }
                self.install(version);
                debug!("Applied version edit: {}", self.current.level_summary());
                Ok(())
            }
            Err(e) => {
                // Start over with a fresh manifest next time
                self.manifest = None;
                if let Some(path) = created {
                    let _ = std::fs::remove_file(path);
                }
                Err(e)
            }
        }
    }

    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, key) in self.compact_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compact_pointer(level, key);
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                edit.add_file(level, (**file).clone());
            }
        }
        edit
    }

    fn install(&mut self, mut version: Version) {
        finalize(&mut version);
        let version = Arc::new(version);
        self.live.retain(|v| v.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    /// Numbers of every table referenced by any version still in use
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.live.retain(|v| v.strong_count() > 0);
        let mut live = HashSet::new();
        for version in self.live.iter().filter_map(Weak::upgrade) {
            version.add_live_files(&mut live);
        }
        self.current.add_live_files(&mut live);
        live
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Give back a number allocated by `new_file_number` that went unused
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn compact_pointer(&self, level: usize) -> &[u8] {
        &self.compact_pointers[level]
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn dbname(&self) -> &Path {
        &self.dbname
    }
}

/// Pick the level most in need of compaction
fn finalize(version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0;
    // The last level has nowhere to compact into
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            version.level_bytes(level) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_level = level;
            best_score = score;
        }
    }
    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BytewiseComparator, Comparator, InternalKey, ValueType};
    use crate::version::edit::FileMetaData;
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn version_set(dir: &Path, icmp: InternalKeyComparator) -> VersionSet {
        let table_cache = Arc::new(TableCache::new(dir, icmp.clone(), None, 10));
        VersionSet::new(dir, icmp, table_cache, false)
    }

    fn meta(number: u64, smallest: &str, largest: &str) -> FileMetaData {
        FileMetaData {
            number,
            file_size: 2048,
            smallest: InternalKey::new(smallest.as_bytes(), 9, ValueType::Value).encode().to_vec(),
            largest: InternalKey::new(largest.as_bytes(), 9, ValueType::Value).encode().to_vec(),
        }
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut vset = version_set(temp_dir.path(), icmp());
            let log = vset.new_file_number();
            let table = vset.new_file_number();
            vset.set_last_sequence(42);

            let mut edit = VersionEdit::new();
            edit.set_log_number(log);
            edit.add_file(0, meta(table, "a", "m"));
            vset.log_and_apply(&mut edit).unwrap();

            let mut edit = VersionEdit::new();
            edit.delete_file(0, table);
            edit.add_file(1, meta(table, "a", "m"));
            edit.set_compact_pointer(0, b"m");
            vset.log_and_apply(&mut edit).unwrap();
        }

        let mut vset = version_set(temp_dir.path(), icmp());
        vset.recover().unwrap();
        assert_eq!(vset.last_sequence(), 42);
        assert_eq!(vset.log_number(), 1);
        assert_eq!(vset.current().level_summary(), "files[ 0 1 0 0 0 0 0 ]");
        assert_eq!(vset.compact_pointer(0), b"m");
        assert!(vset.next_file_number() > 3);

        // The next edit writes a fresh manifest that also recovers
        let mut edit = VersionEdit::new();
        vset.log_and_apply(&mut edit).unwrap();
        let manifest = vset.manifest_file_number();
        let mut reopened = version_set(temp_dir.path(), icmp());
        reopened.recover().unwrap();
        assert_eq!(reopened.current().num_files(1), 1);
        assert_eq!(read_current_file(temp_dir.path()).unwrap(), format!("MANIFEST-{:06}", manifest));
    }

    struct ReverseComparator;

    impl Comparator for ReverseComparator {
        fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            b.cmp(a)
        }
        fn name(&self) -> &str {
            "test.Reverse"
        }
    }

    #[test]
    fn test_comparator_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let mut vset = version_set(temp_dir.path(), icmp());
        vset.log_and_apply(&mut VersionEdit::new()).unwrap();

        let mut other = version_set(
            temp_dir.path(),
            InternalKeyComparator::new(Arc::new(ReverseComparator)),
        );
        assert!(matches!(other.recover(), Err(TideError::InvalidArgument(_))));
    }

    #[test]
    fn test_live_files_include_pinned_versions() {
        let temp_dir = TempDir::new().unwrap();
        let mut vset = version_set(temp_dir.path(), icmp());

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(10, "a", "b"));
        vset.log_and_apply(&mut edit).unwrap();
        let pinned = vset.current();

        let mut edit = VersionEdit::new();
        edit.delete_file(0, 10);
        edit.add_file(1, meta(11, "a", "b"));
        vset.log_and_apply(&mut edit).unwrap();

        let live = vset.live_files();
        assert!(live.contains(&10) && live.contains(&11));

        drop(pinned);
        let live = vset.live_files();
        assert!(!live.contains(&10));
        assert!(live.contains(&11));
    }

    #[test]
    fn test_level0_score_triggers_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let mut vset = version_set(temp_dir.path(), icmp());
        let mut edit = VersionEdit::new();
        for n in 0..L0_COMPACTION_TRIGGER as u64 {
            edit.add_file(0, meta(20 + n, "a", "z"));
        }
        vset.log_and_apply(&mut edit).unwrap();
        assert!(vset.needs_compaction());
        assert_eq!(vset.current().compaction_level, 0);
    }
}
