//! MemTable implementation using a concurrent skip list
//!
//! The MemTable buffers recent writes in internal-key order. Each write adds
//! a new `(user key, sequence, type)` entry; nothing is updated in place, so
//! readers traverse the skip list without locks while the single writer
//! appends.

use crate::batch::BatchHandler;
use crate::iterator::InternalIterator;
use crate::types::{
    append_internal_key, parse_internal_key, InternalKeyComparator, LookupKey,
    SequenceNumber, ValueType,
};
use crate::Result;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Per-entry bookkeeping charged on top of key and value bytes
const ENTRY_OVERHEAD: usize = 64;

/// Skip list key: an encoded internal key ordered by the database comparator
#[derive(Clone)]
struct MemKey {
    key: Bytes,
    icmp: InternalKeyComparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.icmp.compare(&self.key, &other.key) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.key, &other.key)
    }
}

/// Outcome of a memtable point lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// Newest visible version is a value
    Found(Bytes),
    /// Newest visible version is a tombstone
    Deleted,
}

/// MemTable for in-memory writes
pub struct MemTable {
    table: SkipMap<MemKey, Bytes>,
    cmp: InternalKeyComparator,
    /// Approximate size in bytes
    memory_usage: AtomicUsize,
    /// Number of the log file holding this memtable's writes
    log_number: u64,
}

impl MemTable {
    /// Create a new MemTable backed by log `log_number`
    pub fn new(cmp: InternalKeyComparator, log_number: u64) -> Self {
        Self {
            table: SkipMap::new(),
            cmp,
            memory_usage: AtomicUsize::new(0),
            log_number,
        }
    }

    /// Log whose records this memtable holds
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Insert one versioned entry
    pub fn add(&self, sequence: SequenceNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        let mut encoded = Vec::with_capacity(key.len() + 8);
        append_internal_key(&mut encoded, key, sequence, value_type);
        let charge = encoded.len() + value.len() + ENTRY_OVERHEAD;

        self.table.insert(self.mem_key(Bytes::from(encoded)), Bytes::copy_from_slice(value));
        self.memory_usage.fetch_add(charge, AtomicOrdering::Relaxed);
    }

    /// Newest version of the key visible at the lookup key's sequence
    pub fn get(&self, key: &LookupKey) -> Option<LookupResult> {
        let target = self.mem_key(Bytes::copy_from_slice(key.internal_key()));
        let entry = self.table.lower_bound(Bound::Included(&target))?;

        let parsed = parse_internal_key(&entry.key().key)?;
        if self.cmp.compare_user(parsed.user_key, key.user_key()) != Ordering::Equal {
            return None;
        }
        match parsed.value_type {
            ValueType::Value => Some(LookupResult::Found(entry.value().clone())),
            ValueType::Deletion => Some(LookupResult::Deleted),
        }
    }

    /// Get the current size in bytes
    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(AtomicOrdering::Relaxed)
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Cursor over all entries in internal-key order
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: self.clone(),
            current: None,
        }
    }

    fn mem_key(&self, key: Bytes) -> MemKey {
        MemKey {
            key,
            icmp: self.cmp.clone(),
        }
    }
}

/// Applies decoded batch operations with consecutive sequence numbers
pub struct MemTableInserter<'a> {
    pub sequence: SequenceNumber,
    pub mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, &[]);
        self.sequence += 1;
    }
}

/// Cursor over a memtable
///
/// Holds its position as an owned key and re-seeks the skip list on each
/// step, so it can outlive any borrow of the map.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(MemKey, Bytes)>,
}

impl MemTableIterator {
    fn set(&mut self, entry: Option<crossbeam_skiplist::map::Entry<'_, MemKey, Bytes>>) {
        self.current = entry.map(|e| (e.key().clone(), e.value().clone()));
    }
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let mem = self.mem.clone();
        self.set(mem.table.front());
    }

    fn seek_to_last(&mut self) {
        let mem = self.mem.clone();
        self.set(mem.table.back());
    }

    fn seek(&mut self, target: &[u8]) {
        let mem = self.mem.clone();
        let target = mem.mem_key(Bytes::copy_from_slice(target));
        self.set(mem.table.lower_bound(Bound::Included(&target)));
    }

    fn next(&mut self) {
        let mem = self.mem.clone();
        let entry = match &self.current {
            Some((key, _)) => mem.table.lower_bound(Bound::Excluded(key)),
            None => None,
        };
        self.set(entry);
    }

    fn prev(&mut self) {
        let mem = self.mem.clone();
        let entry = match &self.current {
            Some((key, _)) => mem.table.upper_bound(Bound::Excluded(key)),
            None => None,
        };
        self.set(entry);
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| &k.key[..]).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| &v[..]).unwrap_or(&[])
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
