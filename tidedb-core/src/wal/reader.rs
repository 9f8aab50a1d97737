//! WAL reader for recovery

use super::{record_checksum, RECORD_HEADER_SIZE};
use crate::{Result, TideError};
use bytes::Buf;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How the reader treats a record whose checksum does not match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Stop replay at the bad record
    Tolerant,
    /// Fail with `Corruption` unless the bad record is the last one in the file
    Paranoid,
    /// Skip the bad record and keep going (used by repair)
    Salvage,
}

/// Sequential reader over the records of one log file
pub struct LogReader {
    data: Vec<u8>,
    offset: usize,
    path: PathBuf,
    mode: ReadMode,
    dropped_bytes: usize,
    finished: bool,
    /// Offset where the current salvage resync began
    resync_from: Option<usize>,
}

impl LogReader {
    /// Load a log file for replay
    pub fn open(path: impl AsRef<Path>, mode: ReadMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        Ok(Self::from_bytes(data, path, mode))
    }

    pub(crate) fn from_bytes(data: Vec<u8>, path: PathBuf, mode: ReadMode) -> Self {
        Self {
            data,
            offset: 0,
            path,
            mode,
            dropped_bytes: 0,
            finished: false,
            resync_from: None,
        }
    }

    /// Next intact record, or `None` at the end of the valid log
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        while !self.finished {
            let remaining = self.data.len() - self.offset;
            if remaining == 0 {
                self.finished = true;
                break;
            }
            if remaining < RECORD_HEADER_SIZE {
                // Torn header at the tail: the write never completed
                self.drop_tail("truncated record header");
                break;
            }

            let mut header = &self.data[self.offset..self.offset + RECORD_HEADER_SIZE];
            let expected = header.get_u32_le();
            let len = header.get_u32_le() as usize;
            let body_start = self.offset + RECORD_HEADER_SIZE;

            if len > self.data.len() - body_start {
                if self.mode == ReadMode::Salvage {
                    // A damaged length field; look for the next intact header
                    self.skip_byte();
                    continue;
                }
                self.drop_tail("truncated record payload");
                break;
            }

            let body_end = body_start + len;
            let payload = &self.data[body_start..body_end];
            let actual = record_checksum(&self.data[self.offset + 4..body_start], payload);

            if expected == actual {
                let record = payload.to_vec();
                self.finish_resync();
                self.offset = body_end;
                return Ok(Some(record));
            }

            let at_tail = body_end == self.data.len();
            match self.mode {
                // The length may be the damaged part, so body_end cannot be trusted
                ReadMode::Salvage => self.skip_byte(),
                ReadMode::Paranoid if !at_tail => {
                    self.finished = true;
                    return Err(TideError::Corruption(format!(
                        "checksum mismatch at offset {} in {}",
                        self.offset,
                        self.path.display()
                    )));
                }
                _ => {
                    warn!(
                        "Checksum mismatch at offset {} in {:?}, truncating",
                        self.offset, self.path
                    );
                    self.drop_tail("checksum mismatch");
                }
            }
        }
        Ok(None)
    }

    /// Bytes skipped because they were torn or corrupt
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    /// Step one byte past a header that does not verify
    fn skip_byte(&mut self) {
        if self.resync_from.is_none() {
            self.resync_from = Some(self.offset);
        }
        self.dropped_bytes += 1;
        self.offset += 1;
    }

    fn finish_resync(&mut self) {
        if let Some(start) = self.resync_from.take() {
            warn!(
                "Skipped {} corrupt bytes at offset {} in {:?}",
                self.offset - start,
                start,
                self.path
            );
        }
    }

    fn drop_tail(&mut self, reason: &str) {
        let dropped = self.data.len() - self.offset;
        tracing::debug!(
            "Dropping {} bytes at end of {:?}: {}",
            dropped,
            self.path,
            reason
        );
        self.dropped_bytes += dropped;
        self.offset = self.data.len();
        self.finished = true;
        self.finish_resync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{encode_record, LogWriter};
    use tempfile::TempDir;

    fn read_all(reader: &mut LogReader) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn three_records() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&encode_record(b"one"));
        data.extend_from_slice(&encode_record(b"two"));
        data.extend_from_slice(&encode_record(b"three"));
        data
    }

    #[test]
    fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000003.log");

        {
            let mut writer = LogWriter::create(&path).unwrap();
            for i in 0..10 {
                writer.add_record(format!("record-{}", i).as_bytes(), false).unwrap();
            }
            writer.sync().unwrap();
        }

        let mut reader = LogReader::open(&path, ReadMode::Tolerant).unwrap();
        let records = read_all(&mut reader).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[9], b"record-9");
        assert_eq!(reader.dropped_bytes(), 0);
    }

    #[test]
    fn test_torn_tail_is_silently_dropped() {
        let mut data = three_records();
        data.truncate(data.len() - 2);

        for mode in [ReadMode::Tolerant, ReadMode::Paranoid] {
            let mut reader = LogReader::from_bytes(data.clone(), PathBuf::from("t.log"), mode);
            let records = read_all(&mut reader).unwrap();
            assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
        }
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let mut data = three_records();
        // Flip a payload byte of the second record
        let second_payload = RECORD_HEADER_SIZE + 3 + RECORD_HEADER_SIZE;
        data[second_payload] ^= 0xFF;

        let mut reader = LogReader::from_bytes(data.clone(), PathBuf::from("t.log"), ReadMode::Tolerant);
        assert_eq!(read_all(&mut reader).unwrap(), vec![b"one".to_vec()]);

        let mut reader = LogReader::from_bytes(data.clone(), PathBuf::from("t.log"), ReadMode::Paranoid);
        assert_eq!(reader.next_record().unwrap(), Some(b"one".to_vec()));
        assert!(matches!(reader.next_record(), Err(TideError::Corruption(_))));

        let mut reader = LogReader::from_bytes(data, PathBuf::from("t.log"), ReadMode::Salvage);
        assert_eq!(
            read_all(&mut reader).unwrap(),
            vec![b"one".to_vec(), b"three".to_vec()]
        );
    }

    fn four_records() -> (Vec<u8>, usize) {
        let mut data = three_records();
        data.extend_from_slice(&encode_record(b"four"));
        // Length field of the second record
        (data, RECORD_HEADER_SIZE + 3 + 4)
    }

    #[test]
    fn test_salvage_resyncs_after_damaged_length() {
        let expected = vec![b"one".to_vec(), b"three".to_vec(), b"four".to_vec()];

        // Length flipped far past the end of the file
        let (mut data, len_at) = four_records();
        data[len_at + 2] ^= 0x01;
        let mut reader = LogReader::from_bytes(data, PathBuf::from("t.log"), ReadMode::Salvage);
        assert_eq!(read_all(&mut reader).unwrap(), expected);
        assert_eq!(reader.dropped_bytes(), RECORD_HEADER_SIZE + 3);

        // Length shrunk so it still lands inside the file
        let (mut data, len_at) = four_records();
        data[len_at] = 2;
        let mut reader = LogReader::from_bytes(data, PathBuf::from("t.log"), ReadMode::Salvage);
        assert_eq!(read_all(&mut reader).unwrap(), expected);
        assert_eq!(reader.dropped_bytes(), RECORD_HEADER_SIZE + 3);
    }

    #[test]
    fn test_damaged_length_still_truncates_outside_salvage() {
        let (mut data, len_at) = four_records();
        data[len_at + 2] ^= 0x01;

        for mode in [ReadMode::Tolerant, ReadMode::Paranoid] {
            let mut reader = LogReader::from_bytes(data.clone(), PathBuf::from("t.log"), mode);
            assert_eq!(read_all(&mut reader).unwrap(), vec![b"one".to_vec()]);
        }
    }

    #[test]
    fn test_paranoid_tolerates_corrupt_last_record() {
        let mut data = three_records();
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let mut reader = LogReader::from_bytes(data, PathBuf::from("t.log"), ReadMode::Paranoid);
        assert_eq!(
            read_all(&mut reader).unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn test_replaying_twice_is_identical() {
        let data = three_records();
        let mut first = LogReader::from_bytes(data.clone(), PathBuf::from("t.log"), ReadMode::Tolerant);
        let mut second = LogReader::from_bytes(data, PathBuf::from("t.log"), ReadMode::Tolerant);
        assert_eq!(read_all(&mut first).unwrap(), read_all(&mut second).unwrap());
    }
}
