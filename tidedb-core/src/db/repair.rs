//! Rebuild a database whose manifest, logs or tables are damaged
//!
//! Every log is salvaged into a new table, every table is scanned for its
//! key range and highest sequence, and a fresh manifest places all tables in
//! level 0. Tables with unreadable blocks are rewritten from their readable
//! entries; files that cannot be used at all are moved to `lost/`.

use super::with_info_log;
use crate::batch::WriteBatch;
use crate::cache::TableCache;
use crate::compaction::build_table;
use crate::env::Env;
use crate::memtable::{MemTable, MemTableInserter};
use crate::options::Options;
use crate::sstable::{Table, TableBuilder};
use crate::types::{parse_internal_key, InternalKeyComparator, SequenceNumber};
use crate::version::filename::{lock_file_name, log_file_name, lost_dir_name, parse_file_name, table_file_name, FileType};
use crate::version::{FileMetaData, VersionEdit, VersionSet};
use crate::wal::{LogReader, ReadMode};
use crate::{Result, TideError};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Salvage what can be read from the database at `path` and write a new manifest.
///
/// Readable data is never discarded. The database must not be open.
pub fn repair_database(path: impl AsRef<Path>, options: &Options) -> Result<()> {
    let dbname = path.as_ref();
    with_info_log(options.info_log.as_ref(), || Repairer::new(dbname, options).run())
}

struct Repairer<'a> {
    dbname: &'a Path,
    options: &'a Options,
    env: Arc<dyn Env>,
    icmp: InternalKeyComparator,
    next_file_number: u64,
    manifests: Vec<String>,
    logs: Vec<u64>,
    table_numbers: Vec<u64>,
    tables: Vec<FileMetaData>,
    max_sequence: SequenceNumber,
}

/// Key range and count of the readable entries of one table
#[derive(Default)]
struct TableSummary {
    entries: usize,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

impl<'a> Repairer<'a> {
    fn new(dbname: &'a Path, options: &'a Options) -> Self {
        Self {
            dbname,
            options,
            env: options.env.clone(),
            icmp: InternalKeyComparator::new(options.comparator.clone()),
            next_file_number: 1,
            manifests: Vec::new(),
            logs: Vec::new(),
            table_numbers: Vec::new(),
            tables: Vec::new(),
            max_sequence: 0,
        }
    }

    fn run(mut self) -> Result<()> {
        let names = self.env.children(self.dbname)?;
        let _lock = self.env.lock_file(&lock_file_name(self.dbname))?;
        self.find_files(names)?;
        self.convert_logs_to_tables();
        self.extract_metadata();
        self.write_descriptor()?;

        let bytes: u64 = self.tables.iter().map(|t| t.file_size).sum();
        info!(
            "Repaired {}: recovered {} tables ({} bytes), last sequence {}",
            self.dbname.display(),
            self.tables.len(),
            bytes,
            self.max_sequence
        );
        Ok(())
    }

    fn find_files(&mut self, names: Vec<String>) -> Result<()> {
        let mut found = false;
        for name in names {
            let Some((kind, number)) = parse_file_name(&name) else {
                continue;
            };
            found = true;
            self.next_file_number = self.next_file_number.max(number + 1);
            match kind {
                FileType::Descriptor => self.manifests.push(name),
                FileType::Log => self.logs.push(number),
                FileType::Table => self.table_numbers.push(number),
                FileType::Current | FileType::Lock | FileType::Temp => {}
            }
        }
        if !found {
            return Err(TideError::NotFound(format!(
                "{}: no database files to repair",
                self.dbname.display()
            )));
        }
        self.logs.sort_unstable();
        self.table_numbers.sort_unstable();
        Ok(())
    }

    fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    fn convert_logs_to_tables(&mut self) {
        for number in std::mem::take(&mut self.logs) {
            if let Err(e) = self.convert_log(number) {
                warn!("Log #{} ignored: {}", number, e);
            }
            // Its contents now live in a table (or were unreadable)
            self.archive(&log_file_name(self.dbname, number));
        }
    }

    fn convert_log(&mut self, number: u64) -> Result<()> {
        let path = log_file_name(self.dbname, number);
        let mut reader = LogReader::open(&path, ReadMode::Salvage)?;
        let mem = Arc::new(MemTable::new(self.icmp.clone(), number));
        let mut batches = 0usize;
        let mut skipped = 0usize;

        while let Some(record) = reader.next_record()? {
            match WriteBatch::from_contents(&record).and_then(|b| b.validate().map(|_| b)) {
                Ok(batch) => {
                    batch.iterate(&mut MemTableInserter {
                        sequence: batch.sequence(),
                        mem: &mem,
                    })?;
                    batches += 1;
                }
                Err(e) => {
                    warn!("Log #{}: skipping bad batch: {}", number, e);
                    skipped += 1;
                }
            }
        }

        let table_number = self.new_file_number();
        if let Some(meta) = build_table(self.dbname, self.options, &self.icmp, &mut mem.iter(), table_number)? {
            self.table_numbers.push(meta.number);
        }
        info!(
            "Log #{}: {} batches recovered, {} skipped, {} bytes dropped",
            number,
            batches,
            skipped,
            reader.dropped_bytes()
        );
        Ok(())
    }

    fn extract_metadata(&mut self) {
        for number in std::mem::take(&mut self.table_numbers) {
            match self.scan_table(number) {
                Ok(Some(meta)) => self.tables.push(meta),
                Ok(None) => {
                    info!("Table #{} has no readable entries", number);
                    self.archive(&table_file_name(self.dbname, number));
                }
                Err(e) => {
                    warn!("Table #{} ignored: {}", number, e);
                    self.archive(&table_file_name(self.dbname, number));
                }
            }
        }
    }

    fn scan_table(&mut self, number: u64) -> Result<Option<FileMetaData>> {
        let path = table_file_name(self.dbname, number);
        let file_size = self.env.file_size(&path)?;
        let table = Table::open(&path, file_size, self.icmp.clone(), None)?;

        let mut summary = TableSummary::default();
        let mut max_sequence = self.max_sequence;
        let bad_blocks = table.scan_readable(|key, _| {
            if summary.entries == 0 {
                summary.smallest = key.to_vec();
            }
            summary.largest.clear();
            summary.largest.extend_from_slice(key);
            summary.entries += 1;
            if let Some(ikey) = parse_internal_key(key) {
                max_sequence = max_sequence.max(ikey.sequence);
            }
            Ok(())
        })?;
        self.max_sequence = max_sequence;

        if summary.entries == 0 {
            return Ok(None);
        }
        let meta = FileMetaData {
            number,
            file_size,
            smallest: summary.smallest,
            largest: summary.largest,
        };
        if bad_blocks == 0 {
            return Ok(Some(meta));
        }

        warn!("Table #{}: {} unreadable blocks; rewriting {} entries", number, bad_blocks, summary.entries);
        match self.rewrite_table(&table) {
            Ok((new_number, new_size)) => {
                self.archive(&path);
                Ok(Some(FileMetaData {
                    number: new_number,
                    file_size: new_size,
                    ..meta
                }))
            }
            Err(e) => {
                // Keep the original rather than lose its readable blocks
                warn!("Rewriting table #{} failed: {}", number, e);
                Ok(Some(meta))
            }
        }
    }

    /// Copy every readable entry of `table` into a new table file
    fn rewrite_table(&mut self, table: &Table) -> Result<(u64, u64)> {
        let number = self.new_file_number();
        let path = table_file_name(self.dbname, number);
        let written = (|| -> Result<u64> {
            let mut builder = TableBuilder::create(&path, self.options, self.icmp.clone())?;
            table.scan_readable(|key, value| builder.add(key, value))?;
            builder.finish()
        })();
        match written {
            Ok(size) => Ok((number, size)),
            Err(e) => {
                let _ = self.env.remove_file(&path);
                Err(e)
            }
        }
    }

    fn write_descriptor(&mut self) -> Result<()> {
        let table_cache = Arc::new(TableCache::new(self.dbname, self.icmp.clone(), None, 16));
        let mut versions = VersionSet::new(self.dbname, self.icmp.clone(), table_cache, false);
        versions.mark_file_number_used(self.next_file_number);
        versions.set_last_sequence(self.max_sequence);

        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        for meta in &self.tables {
            edit.add_file(0, meta.clone());
        }
        versions.log_and_apply(&mut edit)?;

        for name in std::mem::take(&mut self.manifests) {
            self.archive(&self.dbname.join(name));
        }
        Ok(())
    }

    /// Move a file into `lost/` so nothing is deleted outright
    fn archive(&self, path: &Path) {
        let lost = lost_dir_name(self.dbname);
        let Some(name) = path.file_name() else {
            return;
        };
        let moved = self
            .env
            .create_dir_all(&lost)
            .and_then(|_| self.env.rename(path, &lost.join(name)));
        match moved {
            Ok(()) => info!("Archived {}", path.display()),
            Err(e) => warn!("Could not archive {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::env::ManualEnv;
    use crate::options::{ReadOptions, WriteOptions};
    use crate::version::filename::current_file_name;
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn options() -> Options {
        let mut options = Options::default();
        options
            .set_create_if_missing(true)
            .set_env(Arc::new(ManualEnv::new()))
            .set_block_size(256);
        options
    }

    fn fill(dir: &Path, count: usize, flush: bool) {
        let db = Database::open(dir, options()).unwrap();
        for i in 0..count {
            db.put(&WriteOptions::default(), format!("key{:04}", i).as_bytes(), format!("value{}", i).as_bytes())
                .unwrap();
        }
        if flush {
            db.flush().unwrap();
        }
        db.close().unwrap();
    }

    fn files_with(dir: &Path, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| predicate(n))
            .collect()
    }

    #[test]
    fn test_rebuilds_lost_manifest() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 50, true);

        fs::remove_file(current_file_name(dir.path())).unwrap();
        for name in files_with(dir.path(), |n| n.starts_with("MANIFEST-")) {
            fs::remove_file(dir.path().join(name)).unwrap();
        }

        repair_database(dir.path(), &options()).unwrap();
        let db = Database::open(dir.path(), options()).unwrap();
        for i in 0..50 {
            let value = db.get(&ReadOptions::default(), format!("key{:04}", i).as_bytes()).unwrap();
            assert_eq!(value, Some(format!("value{}", i).into_bytes()));
        }
        assert_eq!(db.property("tidedb.last-sequence").as_deref(), Some("50"));
    }

    #[test]
    fn test_salvages_unflushed_log() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 20, false);

        // Garbage after the last record
        let log = files_with(dir.path(), |n| n.ends_with(".log")).pop().unwrap();
        let mut file = OpenOptions::new().append(true).open(dir.path().join(&log)).unwrap();
        file.write_all(&[0xAB; 37]).unwrap();
        drop(file);

        repair_database(dir.path(), &options()).unwrap();
        assert!(lost_dir_name(dir.path()).join(&log).exists());

        let db = Database::open(dir.path(), options()).unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"key0019").unwrap(), Some(b"value19".to_vec()));
        assert_eq!(db.property("tidedb.num-files-at-level0").as_deref(), Some("1"));
    }

    #[test]
    fn test_salvage_skips_record_with_damaged_length() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 20, false);

        // Walk the record headers to the length field of the sixth record
        let log = files_with(dir.path(), |n| n.ends_with(".log")).pop().unwrap();
        let path = dir.path().join(&log);
        let mut data = fs::read(&path).unwrap();
        let mut offset = 0;
        for _ in 0..5 {
            let len = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
            offset += crate::wal::RECORD_HEADER_SIZE + len;
        }
        data[offset + 6] ^= 0x40;
        fs::write(&path, &data).unwrap();

        repair_database(dir.path(), &options()).unwrap();

        let db = Database::open(dir.path(), options()).unwrap();
        let ro = ReadOptions::default();
        assert_eq!(db.get(&ro, b"key0005").unwrap(), None);
        for i in (0..20).filter(|&i| i != 5) {
            let value = db.get(&ro, format!("key{:04}", i).as_bytes()).unwrap();
            assert_eq!(value, Some(format!("value{}", i).into_bytes()), "key{:04}", i);
        }
    }

    #[test]
    fn test_rewrites_table_with_bad_block() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 200, true);

        let table = files_with(dir.path(), |n| n.ends_with(".sst")).pop().unwrap();
        let mut file = OpenOptions::new().write(true).open(dir.path().join(&table)).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[0xFF, 0x00, 0xFF]).unwrap();
        drop(file);

        repair_database(dir.path(), &options()).unwrap();
        assert!(lost_dir_name(dir.path()).join(&table).exists());

        let db = Database::open(dir.path(), options()).unwrap();
        let mut survivors = 0;
        for i in 0..200 {
            // Lost entries read as absent, never as errors
            if let Some(value) = db.get(&ReadOptions::default(), format!("key{:04}", i).as_bytes()).unwrap() {
                assert_eq!(value, format!("value{}", i).into_bytes());
                survivors += 1;
            }
        }
        assert!(survivors > 150 && survivors < 200, "survivors: {}", survivors);
        assert!(db.get(&ReadOptions::default(), b"key0199").unwrap().is_some());
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(repair_database(&missing, &options()).is_err());
        assert!(!missing.exists());
    }
}
