//! An immutable snapshot of the live table files per level

use super::edit::{FileMetaData, VersionEdit};
use crate::cache::TableCache;
use crate::config::NUM_LEVELS;
use crate::iterator::{BlockSource, InternalIterator, TwoLevelIterator};
use crate::memtable::LookupResult;
use crate::options::ReadOptions;
use crate::sstable::BlockHandle;
use crate::types::{parse_internal_key, InternalKeyComparator, LookupKey, SequenceNumber, ValueType};
use crate::{Result, TideError};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// Files per level. Level 0 files may overlap and are ordered oldest first;
/// files in deeper levels are disjoint and sorted by key.
pub struct Version {
    files: Vec<Vec<Arc<FileMetaData>>>,
    icmp: InternalKeyComparator,
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
}

/// Index of the first file whose largest key is >= `key`
pub(crate) fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], key: &[u8]) -> usize {
    files.partition_point(|f| icmp.compare(&f.largest, key) == Ordering::Less)
}

impl Version {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            icmp,
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    /// Build the successor of `self` with `edit` applied
    pub(crate) fn apply(&self, edit: &VersionEdit) -> Result<Version> {
        let mut next = Version::new(self.icmp.clone());
        for level in 0..NUM_LEVELS {
            next.files[level] = self.files[level]
                .iter()
                .filter(|f| !edit.deleted_files.contains(&(level, f.number)))
                .cloned()
                .collect();
        }
        for (level, file) in &edit.new_files {
            if *level >= NUM_LEVELS {
                return Err(TideError::Corruption(format!("file #{} at bad level {}", file.number, level)));
            }
            if edit.deleted_files.contains(&(*level, file.number)) {
                continue;
            }
            next.files[*level].push(Arc::new(file.clone()));
        }

        next.files[0].sort_by_key(|f| f.number);
        for level in 1..NUM_LEVELS {
            let icmp = &self.icmp;
            next.files[level].sort_by(|a, b| icmp.compare(&a.smallest, &b.smallest));
            for pair in next.files[level].windows(2) {
                if icmp.compare_user(pair[0].largest_user_key(), pair[1].smallest_user_key()) != Ordering::Less {
                    return Err(TideError::Corruption(format!(
                        "overlapping files {:?} and {:?} in level {}",
                        pair[0], pair[1], level
                    )));
                }
            }
        }
        Ok(next)
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Add the numbers of every referenced file to `live`
    pub fn add_live_files(&self, live: &mut HashSet<u64>) {
        for level in &self.files {
            live.extend(level.iter().map(|f| f.number));
        }
    }

    /// Newest version of `key` visible at its sequence, searching tables only
    pub fn get(&self, options: &ReadOptions, key: &LookupKey, table_cache: &TableCache) -> Result<Option<LookupResult>> {
        let user_key = key.user_key();

        // Level 0 files overlap: the highest sequence among them wins
        let mut best: Option<(SequenceNumber, LookupResult)> = None;
        for file in &self.files[0] {
            if !self.contains_user_key(file, user_key) {
                continue;
            }
            if let Some((sequence, result)) = self.search_file(options, table_cache, file, key)? {
                if best.as_ref().map_or(true, |(s, _)| sequence > *s) {
                    best = Some((sequence, result));
                }
            }
        }
        if let Some((_, result)) = best {
            return Ok(Some(result));
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            let index = find_file(&self.icmp, files, key.internal_key());
            let Some(file) = files.get(index) else { continue };
            if self.icmp.compare_user(user_key, file.smallest_user_key()) == Ordering::Less {
                continue;
            }
            if let Some((_, result)) = self.search_file(options, table_cache, file, key)? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    fn contains_user_key(&self, file: &FileMetaData, user_key: &[u8]) -> bool {
        self.icmp.compare_user(user_key, file.smallest_user_key()) != Ordering::Less
            && self.icmp.compare_user(user_key, file.largest_user_key()) != Ordering::Greater
    }

    fn search_file(
        &self,
        options: &ReadOptions,
        table_cache: &TableCache,
        file: &FileMetaData,
        key: &LookupKey,
    ) -> Result<Option<(SequenceNumber, LookupResult)>> {
        let Some((found, value)) = table_cache.get(options, file.number, file.file_size, key.internal_key())? else {
            return Ok(None);
        };
        let parsed = parse_internal_key(&found)
            .ok_or_else(|| TideError::Corruption(format!("bad internal key in table #{}", file.number)))?;
        if self.icmp.compare_user(parsed.user_key, key.user_key()) != Ordering::Equal {
            return Ok(None);
        }
        let result = match parsed.value_type {
            ValueType::Value => LookupResult::Found(Bytes::from(value)),
            ValueType::Deletion => LookupResult::Deleted,
        };
        Ok(Some((parsed.sequence, result)))
    }

    /// Does any file in `level` overlap the user key range?
    ///
    /// `None` bounds are open-ended.
    pub fn overlap_in_level(&self, level: usize, smallest: Option<&[u8]>, largest: Option<&[u8]>) -> bool {
        self.files[level].iter().any(|f| self.file_overlaps(f, smallest, largest))
    }

    fn file_overlaps(&self, file: &FileMetaData, smallest: Option<&[u8]>, largest: Option<&[u8]>) -> bool {
        let after = smallest
            .is_some_and(|s| self.icmp.compare_user(file.largest_user_key(), s) == Ordering::Less);
        let before = largest
            .is_some_and(|l| self.icmp.compare_user(file.smallest_user_key(), l) == Ordering::Greater);
        !after && !before
    }

    /// Files in `level` overlapping the user key range `[begin, end]`.
    ///
    /// In level 0 the range grows to cover every file it touches, since a
    /// key's versions may be spread across overlapping files.
    pub fn overlapping_inputs(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            if !self.file_overlaps(file, begin.as_deref(), end.as_deref()) {
                continue;
            }
            inputs.push(file.clone());
            if level == 0 {
                let mut restart = false;
                if let Some(b) = &begin {
                    if self.icmp.compare_user(file.smallest_user_key(), b) == Ordering::Less {
                        begin = Some(file.smallest_user_key().to_vec());
                        restart = true;
                    }
                }
                if let Some(e) = &end {
                    if self.icmp.compare_user(file.largest_user_key(), e) == Ordering::Greater {
                        end = Some(file.largest_user_key().to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Push one iterator per level-0 file and one concatenating iterator per deeper level
    pub fn add_iterators(
        &self,
        options: &ReadOptions,
        table_cache: &Arc<TableCache>,
        iters: &mut Vec<Box<dyn InternalIterator>>,
    ) {
        // Newest first
        for file in self.files[0].iter().rev() {
            iters.push(table_cache.iter(options, file.number, file.file_size));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(self.level_iter(level, options, table_cache));
            }
        }
    }

    /// Iterator over every entry of a sorted level
    pub fn level_iter(&self, level: usize, options: &ReadOptions, table_cache: &Arc<TableCache>) -> Box<dyn InternalIterator> {
        level_concat_iter(self.files[level].clone(), self.icmp.clone(), options, table_cache)
    }

    /// Approximate byte offset of `key` within the whole database
    pub fn approximate_offset_of(&self, key: &[u8], table_cache: &TableCache) -> u64 {
        let mut result = 0;
        for (level, files) in self.files.iter().enumerate() {
            for file in files {
                if self.icmp.compare(&file.largest, key) != Ordering::Greater {
                    result += file.file_size;
                } else if self.icmp.compare(&file.smallest, key) == Ordering::Greater {
                    if level > 0 {
                        // Sorted level: no later file can contain key
                        break;
                    }
                } else if let Ok(table) = table_cache.find_table(file.number, file.file_size) {
                    result += table.approximate_offset_of(key);
                }
            }
        }
        result
    }

    /// `files[ 3 1 0 0 0 0 0 ]`
    pub fn level_summary(&self) -> String {
        let mut out = String::from("files[");
        for level in &self.files {
            let _ = write!(out, " {}", level.len());
        }
        out.push_str(" ]");
        out
    }

    /// One line per file, grouped by level
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            let _ = writeln!(out, "--- level {} ---", level);
            for file in files {
                let _ = writeln!(out, " {:?}", file);
            }
        }
        out
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.level_summary())
    }
}

/// Concatenating iterator over the disjoint, sorted files of one level
pub(crate) fn level_concat_iter(
    files: Vec<Arc<FileMetaData>>,
    icmp: InternalKeyComparator,
    options: &ReadOptions,
    table_cache: &Arc<TableCache>,
) -> Box<dyn InternalIterator> {
    Box::new(TwoLevelIterator::new(
        Box::new(LevelFileIterator::new(files, icmp)),
        TableSource {
            table_cache: table_cache.clone(),
            verify_checksums: options.verify_checksums,
            fill_cache: options.fill_cache,
        },
    ))
}

/// Walks a level's file list: key = file's largest key, value = (number, size)
struct LevelFileIterator {
    files: Vec<Arc<FileMetaData>>,
    icmp: InternalKeyComparator,
    index: usize,
    value: [u8; BlockHandle::ENCODED_LENGTH],
}

impl LevelFileIterator {
    fn new(files: Vec<Arc<FileMetaData>>, icmp: InternalKeyComparator) -> Self {
        let index = files.len();
        Self {
            files,
            icmp,
            index,
            value: [0; BlockHandle::ENCODED_LENGTH],
        }
    }

    fn fill_value(&mut self) {
        if let Some(file) = self.files.get(self.index) {
            self.value[..8].copy_from_slice(&file.number.to_le_bytes());
            self.value[8..].copy_from_slice(&file.file_size.to_le_bytes());
        }
    }
}

impl InternalIterator for LevelFileIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() { 0 } else { self.files.len() - 1 };
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        // Stepping before the first file invalidates the cursor
        self.index = self.index.checked_sub(1).unwrap_or(self.files.len());
        self.fill_value();
    }

    fn key(&self) -> &[u8] {
        self.files.get(self.index).map(|f| f.largest.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        &self.value
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

struct TableSource {
    table_cache: Arc<TableCache>,
    verify_checksums: bool,
    fill_cache: bool,
}

impl BlockSource for TableSource {
    fn open_block(&self, handle: &[u8]) -> Result<Box<dyn InternalIterator>> {
        let handle = BlockHandle::decode(handle)?;
        let table = self.table_cache.find_table(handle.offset, handle.size)?;
        let mut options = ReadOptions::default();
        options.verify_checksums = self.verify_checksums;
        options.fill_cache = self.fill_cache;
        Ok(table.iter(&options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BytewiseComparator, InternalKey};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: &str, largest: &str) -> FileMetaData {
        FileMetaData {
            number,
            file_size: 100,
            smallest: InternalKey::new(smallest.as_bytes(), 100, ValueType::Value).encode().to_vec(),
            largest: InternalKey::new(largest.as_bytes(), 100, ValueType::Value).encode().to_vec(),
        }
    }

    fn version_with(files: &[(usize, FileMetaData)]) -> Version {
        let mut edit = VersionEdit::new();
        for (level, file) in files {
            edit.add_file(*level, file.clone());
        }
        Version::new(icmp()).apply(&edit).unwrap()
    }

    fn numbers(files: &[Arc<FileMetaData>]) -> Vec<u64> {
        files.iter().map(|f| f.number).collect()
    }

    #[test]
    fn test_apply_sorts_and_deletes() {
        let base = version_with(&[
            (0, meta(5, "a", "c")),
            (0, meta(3, "b", "d")),
            (1, meta(7, "m", "p")),
            (1, meta(6, "e", "g")),
        ]);
        assert_eq!(numbers(base.files(0)), vec![3, 5]);
        assert_eq!(numbers(base.files(1)), vec![6, 7]);

        let mut edit = VersionEdit::new();
        edit.delete_file(0, 3);
        edit.add_file(2, meta(9, "a", "z"));
        let next = base.apply(&edit).unwrap();
        assert_eq!(numbers(next.files(0)), vec![5]);
        assert_eq!(numbers(next.files(2)), vec![9]);
        assert_eq!(next.level_summary(), "files[ 1 2 1 0 0 0 0 ]");

        // The base version is untouched
        assert_eq!(base.num_files(0), 2);
    }

    #[test]
    fn test_apply_rejects_overlap_in_sorted_level() {
        let base = version_with(&[(1, meta(1, "a", "f"))]);
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(2, "e", "k"));
        assert!(base.apply(&edit).unwrap_err().is_corruption());
    }

    #[test]
    fn test_find_file() {
        let v = version_with(&[(1, meta(1, "b", "d")), (1, meta(2, "f", "h")), (1, meta(3, "j", "l"))]);
        let files = v.files(1);
        let key = |k: &str| InternalKey::new(k.as_bytes(), 50, ValueType::Value).encode().to_vec();
        assert_eq!(find_file(&v.icmp, files, &key("a")), 0);
        assert_eq!(find_file(&v.icmp, files, &key("e")), 1);
        assert_eq!(find_file(&v.icmp, files, &key("h")), 1);
        assert_eq!(find_file(&v.icmp, files, &key("z")), 3);
    }

    #[test]
    fn test_overlapping_inputs_expands_level0() {
        let v = version_with(&[
            (0, meta(1, "a", "c")),
            (0, meta(2, "c", "f")),
            (0, meta(3, "x", "z")),
            (1, meta(4, "a", "b")),
            (1, meta(5, "d", "e")),
        ]);
        let inputs = v.overlapping_inputs(0, Some(b"e"), Some(b"e"));
        let mut got = numbers(&inputs);
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);

        assert_eq!(numbers(&v.overlapping_inputs(1, Some(b"c"), Some(b"z"))), vec![5]);
        assert_eq!(numbers(&v.overlapping_inputs(1, None, None)), vec![4, 5]);
        assert!(v.overlap_in_level(1, Some(b"b"), Some(b"c")));
        assert!(!v.overlap_in_level(1, Some(b"f"), Some(b"w")));
    }

    #[test]
    fn test_level_file_iterator() {
        let files: Vec<_> = [meta(1, "a", "c"), meta(2, "e", "g")].into_iter().map(Arc::new).collect();
        let mut iter = LevelFileIterator::new(files, icmp());
        assert!(!iter.valid());
        iter.seek_to_last();
        assert_eq!(BlockHandle::decode(iter.value()).unwrap().offset, 2);
        iter.prev();
        assert_eq!(BlockHandle::decode(iter.value()).unwrap().offset, 1);
        iter.prev();
        assert!(!iter.valid());
        iter.seek(InternalKey::new(b"d", 1, ValueType::Value).encode());
        assert_eq!(BlockHandle::decode(iter.value()).unwrap().offset, 2);
    }
}
