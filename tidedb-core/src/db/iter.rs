//! User-facing iterator over the merged database state

use super::snapshot::Snapshot;
use crate::iterator::InternalIterator;
use crate::types::{append_internal_key, extract_user_key, parse_internal_key, Comparator, SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK};
use crate::version::Version;
use crate::{Result, TideError};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The inner iterator sits on the entry that produced `key()`
    Forward,
    /// The inner iterator sits just before every entry of `key()`;
    /// the current entry is cached in `saved_key` / `saved_value`
    Reverse,
}

/// Ordered cursor over the live keys of a database as of one sequence number.
///
/// Only the newest visible version of each key is yielded and deleted keys
/// are skipped. The iterator holds its own references to the memtables and
/// table files it reads, so it stays consistent while the database keeps
/// changing and even after the database is closed.
pub struct DbIterator {
    iter: Box<dyn InternalIterator>,
    ucmp: Arc<dyn Comparator>,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    error: Option<TideError>,
    _version: Arc<Version>,
    _snapshot: Option<Snapshot>,
}

impl DbIterator {
    pub(crate) fn new(
        iter: Box<dyn InternalIterator>,
        ucmp: Arc<dyn Comparator>,
        sequence: SequenceNumber,
        version: Arc<Version>,
        snapshot: Option<Snapshot>,
    ) -> Self {
        Self {
            iter,
            ucmp,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            error: None,
            _version: version,
            _snapshot: snapshot,
        }
    }

    /// True while positioned on an entry
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current key, `None` unless [`valid`](Self::valid)
    pub fn key(&self) -> Option<&[u8]> {
        if !self.valid {
            return None;
        }
        Some(match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        })
    }

    /// Current value, `None` unless [`valid`](Self::valid)
    pub fn value(&self) -> Option<&[u8]> {
        if !self.valid {
            return None;
        }
        Some(match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        })
    }

    /// First error hit while reading, if any
    pub fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => self.iter.status(),
        }
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Position at the first key at or after `target`
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(&mut self.saved_key, target, self.sequence, VALUE_TYPE_FOR_SEEK);
        self.iter.seek(&self.saved_key);
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        if !self.valid {
            return;
        }

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // Step into the entries of the current key; the skip logic
            // below moves past them using saved_key
            if self.iter.valid() {
                self.iter.next();
            } else {
                self.iter.seek_to_first();
            }
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.iter.key()));
            self.iter.next();
        }

        if !self.iter.valid() {
            self.valid = false;
            self.saved_key.clear();
            return;
        }
        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }

        if self.direction == Direction::Forward {
            // Back up to the last entry of the previous user key
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.iter.key()));
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self.ucmp.compare(extract_user_key(self.iter.key()), &self.saved_key) == Ordering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    /// Advance to the newest visible value at or after the current position,
    /// skipping entries of `saved_key` when `skipping`
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert_eq!(self.direction, Direction::Forward);
        while self.iter.valid() {
            match parse_internal_key(self.iter.key()) {
                Some(ikey) if ikey.sequence <= self.sequence => match ikey.value_type {
                    ValueType::Deletion => {
                        // Everything older for this key is hidden
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(ikey.user_key);
                        skipping = true;
                    }
                    ValueType::Value => {
                        let hidden =
                            skipping && self.ucmp.compare(ikey.user_key, &self.saved_key) != Ordering::Greater;
                        if !hidden {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                },
                Some(_) => {}
                None => self.record_corrupt_key(),
            }
            self.iter.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Walk backwards collecting the newest visible entry of the previous user key
    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);
        let mut value_type = ValueType::Deletion;
        while self.iter.valid() {
            match parse_internal_key(self.iter.key()) {
                Some(ikey) if ikey.sequence <= self.sequence => {
                    if value_type != ValueType::Deletion
                        && self.ucmp.compare(ikey.user_key, &self.saved_key) == Ordering::Less
                    {
                        // Reached an older key while holding a live value
                        break;
                    }
                    value_type = ikey.value_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(ikey.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.iter.value());
                    }
                }
                Some(_) => {}
                None => self.record_corrupt_key(),
            }
            self.iter.prev();
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    fn record_corrupt_key(&mut self) {
        if self.error.is_none() {
            self.error = Some(TideError::Corruption("corrupted internal key in iterator".into()));
        }
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("sequence", &self.sequence)
            .field("valid", &self.valid)
            .finish()
    }
}
