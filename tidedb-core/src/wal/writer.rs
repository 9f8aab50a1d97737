//! WAL writer implementation

use super::encode_record;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends records to one log file
pub struct LogWriter {
    file: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

impl LogWriter {
    /// Create (truncating) a log file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            file: BufWriter::new(file),
            path,
            bytes_written: 0,
        })
    }

    /// Append a record; with `sync` the record is on stable storage when this returns
    pub fn add_record(&mut self, payload: &[u8], sync: bool) -> Result<()> {
        let record = encode_record(payload);
        self.file.write_all(&record)?;
        self.bytes_written += record.len() as u64;

        // Always hand the bytes to the OS so a process crash loses nothing
        self.file.flush()?;
        if sync {
            self.file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Bytes appended through this writer
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::RECORD_HEADER_SIZE;
    use tempfile::TempDir;

    #[test]
    fn test_log_writer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.log");

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"first", false).unwrap();
        writer.add_record(b"second", true).unwrap();
        writer.sync().unwrap();

        let expected = (2 * RECORD_HEADER_SIZE + 5 + 6) as u64;
        assert_eq!(writer.bytes_written(), expected);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }
}
