//! Names of the files inside a database directory

use crate::Result;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Kind of a file found in a database directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Descriptor,
    Current,
    Lock,
    Temp,
}

pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.log", number))
}

pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.sst", number))
}

pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.dbtmp", number))
}

pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// Directory repair moves unusable files into
pub fn lost_dir_name(dbname: &Path) -> PathBuf {
    dbname.join("lost")
}

/// Classify a directory entry; `None` for files the engine does not own
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        _ => {}
    }
    if let Some(number) = name.strip_prefix("MANIFEST-") {
        return parse_number(number).map(|n| (FileType::Descriptor, n));
    }

    let (stem, ext) = name.split_once('.')?;
    let number = parse_number(stem)?;
    let kind = match ext {
        "log" => FileType::Log,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((kind, number))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Point `CURRENT` at `MANIFEST-<manifest_number>` atomically
pub fn set_current_file(dbname: &Path, manifest_number: u64) -> Result<()> {
    let manifest = descriptor_file_name(dbname, manifest_number);
    let contents = manifest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let tmp = temp_file_name(dbname, manifest_number);
    let written = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}", contents)?;
        file.sync_all()?;
        fs::rename(&tmp, current_file_name(dbname))?;
        Ok(())
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Manifest name recorded in `CURRENT`
pub fn read_current_file(dbname: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dbname))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || name.contains('\n') {
        return Err(crate::TideError::Corruption(
            "CURRENT file does not name a manifest".into(),
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_file_names() {
        assert_eq!(parse_file_name("000012.log"), Some((FileType::Log, 12)));
        assert_eq!(parse_file_name("000007.sst"), Some((FileType::Table, 7)));
        assert_eq!(parse_file_name("000009.dbtmp"), Some((FileType::Temp, 9)));
        assert_eq!(parse_file_name("MANIFEST-000003"), Some((FileType::Descriptor, 3)));
        assert_eq!(parse_file_name("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_file_name("LOCK"), Some((FileType::Lock, 0)));

        assert_eq!(parse_file_name("notes.txt"), None);
        assert_eq!(parse_file_name("12a.log"), None);
        assert_eq!(parse_file_name("MANIFEST-"), None);
        assert_eq!(parse_file_name(".log"), None);
    }

    #[test]
    fn test_names_round_trip_through_parser() {
        let db = Path::new("/db");
        let name = table_file_name(db, 42);
        let file = name.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_file_name(file), Some((FileType::Table, 42)));
    }

    #[test]
    fn test_set_current_file() {
        let temp_dir = TempDir::new().unwrap();
        set_current_file(temp_dir.path(), 5).unwrap();
        assert_eq!(read_current_file(temp_dir.path()).unwrap(), "MANIFEST-000005");
        assert!(!temp_file_name(temp_dir.path(), 5).exists());
    }
}
