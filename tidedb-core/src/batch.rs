//! Atomic batches of puts and deletes
//!
//! Format:
//! - 8 bytes: base sequence number
//! - 4 bytes: record count
//! - records, each:
//!   - 1 byte: kind (`ValueType`)
//!   - 4 bytes: key length, then key
//!   - for puts only: 4 bytes value length, then value
//!
//! The encoded batch is exactly the payload of a WAL record.

use crate::types::{SequenceNumber, ValueType};
use crate::{Result, TideError};
use bytes::{Buf, BufMut};
use std::fmt;

/// Size of the sequence + count header
pub const HEADER_SIZE: usize = 12;

/// Receiver of decoded batch operations
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// An ordered list of put/delete operations applied atomically
#[derive(Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; HEADER_SIZE],
        }
    }

    /// Queue `key -> value`
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value as u8);
        self.rep.put_u32_le(key.len() as u32);
        self.rep.put_slice(key);
        self.rep.put_u32_le(value.len() as u32);
        self.rep.put_slice(value);
    }

    /// Queue removal of `key`
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion as u8);
        self.rep.put_u32_le(key.len() as u32);
        self.rep.put_slice(key);
    }

    /// Drop every queued operation
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// Number of queued operations
    pub fn count(&self) -> u32 {
        (&self.rep[8..HEADER_SIZE]).get_u32_le()
    }

    /// True if nothing has been queued
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Encoded size in bytes
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Append every operation of `other` after ours
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// Replay the batch into `handler`, in insertion order
    pub fn iterate<H: BatchHandler>(&self, handler: &mut H) -> Result<()> {
        let mut input = &self.rep[HEADER_SIZE..];
        let mut found = 0u32;

        while input.has_remaining() {
            found += 1;
            let kind = input.get_u8();
            let key = take_slice(&mut input)?;
            match ValueType::from_u8(kind) {
                Some(ValueType::Value) => {
                    let value = take_slice(&mut input)?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => handler.delete(key),
                None => {
                    return Err(TideError::Corruption(format!(
                        "unknown write batch tag {}",
                        kind
                    )))
                }
            }
        }

        if found != self.count() {
            return Err(TideError::Corruption(format!(
                "write batch has wrong count: header says {}, found {}",
                self.count(),
                found
            )));
        }
        Ok(())
    }

    /// Decode the whole batch without applying it
    pub fn validate(&self) -> Result<()> {
        struct Discard;
        impl BatchHandler for Discard {
            fn put(&mut self, _key: &[u8], _value: &[u8]) {}
            fn delete(&mut self, _key: &[u8]) {}
        }
        self.iterate(&mut Discard)
    }

    /// Rebuild a batch from its encoded form, e.g. a WAL record
    pub fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < HEADER_SIZE {
            return Err(TideError::Corruption("write batch too small".into()));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }

    /// Encoded form
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        (&self.rep[..8]).get_u64_le()
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBatch")
            .field("sequence", &self.sequence())
            .field("count", &self.count())
            .field("bytes", &self.rep.len())
            .finish()
    }
}

fn take_slice<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    if input.remaining() < 4 {
        return Err(TideError::Corruption("truncated write batch record".into()));
    }
    let len = input.get_u32_le() as usize;
    if input.remaining() < len {
        return Err(TideError::Corruption("truncated write batch record".into()));
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl BatchHandler for Recorder {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.0.push(format!(
                "Put({}, {})",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
        }

        fn delete(&mut self, key: &[u8]) {
            self.0.push(format!("Delete({})", String::from_utf8_lossy(key)));
        }
    }

    fn contents(batch: &WriteBatch) -> Vec<String> {
        let mut recorder = Recorder::default();
        batch.iterate(&mut recorder).unwrap();
        recorder.0
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert!(batch.is_empty());
        assert!(contents(&batch).is_empty());
    }

    #[test]
    fn test_operations_in_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        batch.delete(b"box");
        batch.put(b"baz", b"boo");
        batch.set_sequence(100);

        assert_eq!(batch.count(), 3);
        assert_eq!(batch.sequence(), 100);
        assert_eq!(
            contents(&batch),
            vec!["Put(foo, bar)", "Delete(box)", "Put(baz, boo)"]
        );
    }

    #[test]
    fn test_clear_resets() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.clear();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.approximate_size(), HEADER_SIZE);
    }

    #[test]
    fn test_append() {
        let mut b1 = WriteBatch::new();
        let mut b2 = WriteBatch::new();
        b1.put(b"a", b"va");
        b2.put(b"b", b"vb");
        b2.delete(b"foo");
        b1.append(&b2);

        assert_eq!(b1.count(), 3);
        assert_eq!(contents(&b1), vec!["Put(a, va)", "Put(b, vb)", "Delete(foo)"]);
    }

    #[test]
    fn test_truncated_batch_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        let encoded = batch.contents();

        let truncated = WriteBatch::from_contents(&encoded[..encoded.len() - 1]).unwrap();
        assert!(matches!(truncated.validate(), Err(TideError::Corruption(_))));
        assert!(WriteBatch::from_contents(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_wrong_count_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        batch.set_count(2);
        assert!(batch.validate().is_err());
    }
}
