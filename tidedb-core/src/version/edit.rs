//! Manifest records describing changes to the set of live files

use crate::types::{extract_user_key, SequenceNumber};
use crate::{Result, TideError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Metadata of one table file
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the table
    pub smallest: Vec<u8>,
    /// Largest internal key in the table
    pub largest: Vec<u8>,
}

impl FileMetaData {
    pub fn smallest_user_key(&self) -> &[u8] {
        extract_user_key(&self.smallest)
    }

    pub fn largest_user_key(&self) -> &[u8] {
        extract_user_key(&self.largest)
    }
}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ({} bytes) [{:?} .. {:?}]",
            self.number,
            self.file_size,
            String::from_utf8_lossy(self.smallest_user_key()),
            String::from_utf8_lossy(self.largest_user_key())
        )
    }
}

/// Delta between two versions, persisted as one manifest record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: &[u8]) {
        self.compact_pointers.push((level, key.to_vec()));
    }

    pub fn add_file(&mut self, level: usize, file: FileMetaData) {
        self.new_files.push((level, file));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TideError::Internal(format!("encode version edit: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| TideError::Corruption(format!("bad version edit: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InternalKey, ValueType};

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMetaData {
        FileMetaData {
            number,
            file_size: 1024,
            smallest: InternalKey::new(smallest, 1, ValueType::Value).encode().to_vec(),
            largest: InternalKey::new(largest, 1, ValueType::Value).encode().to_vec(),
        }
    }

    #[test]
    fn test_edit_encode_decode() {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("tidedb.BytewiseComparator");
        edit.set_log_number(7);
        edit.set_next_file_number(12);
        edit.set_last_sequence(1000);
        edit.set_compact_pointer(1, b"m");
        edit.add_file(0, meta(10, b"a", b"k"));
        edit.delete_file(1, 4);

        let decoded = VersionEdit::decode(&edit.encode().unwrap()).unwrap();
        assert_eq!(decoded, edit);
        assert_eq!(decoded.new_files[0].1.largest_user_key(), b"k");
    }

    #[test]
    fn test_decode_garbage_is_corruption() {
        let err = VersionEdit::decode(&[0xff; 3]).unwrap_err();
        assert!(err.is_corruption());
    }
}
