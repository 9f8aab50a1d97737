//! Prefix-compressed key/value blocks
//!
//! Entry layout:
//! ```text
//! [shared u32][non_shared u32][value_len u32][key suffix][value]
//! ```
//! Every `restart_interval` entries the key is stored in full (`shared = 0`)
//! and its offset is recorded in the restart array at the end of the block:
//! ```text
//! [restart offset u32]... [num_restarts u32]
//! ```

use crate::iterator::InternalIterator;
use crate::types::InternalKeyComparator;
use crate::{Result, TideError};
use bytes::{Buf, BufMut, Bytes};
use std::cmp::Ordering;

const ENTRY_HEADER_SIZE: usize = 12;

/// Builds one block
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    restart_interval: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            restart_interval: restart_interval.max(1),
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Append an entry; keys must arrive in increasing order
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);

        let shared = if self.counter < self.restart_interval {
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let non_shared = key.len() - shared;

        self.buffer.put_u32_le(shared as u32);
        self.buffer.put_u32_le(non_shared as u32);
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        self.counter += 1;
    }

    /// Append the restart array and return the finished block
    pub fn finish(&mut self) -> &[u8] {
        if !self.finished {
            for &restart in &self.restarts {
                self.buffer.put_u32_le(restart);
            }
            self.buffer.put_u32_le(self.restarts.len() as u32);
            self.finished = true;
        }
        &self.buffer
    }

    /// Size the block would have if finished now
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}

/// Decoded, immutable block
#[derive(Debug)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(TideError::Corruption("block too small".into()));
        }
        let num_restarts = (&data[data.len() - 4..]).get_u32_le() as usize;
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts == 0 || num_restarts > max_restarts {
            return Err(TideError::Corruption(format!(
                "bad restart count {} in block of {} bytes",
                num_restarts,
                data.len()
            )));
        }
        Ok(Self {
            restart_offset: data.len() - 4 - num_restarts * 4,
            num_restarts,
            data,
        })
    }

    /// Bytes charged to the block cache
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self, cmp: InternalKeyComparator) -> BlockIterator {
        BlockIterator {
            data: self.data.clone(),
            restart_offset: self.restart_offset,
            num_restarts: self.num_restarts,
            cmp,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            error: None,
        }
    }
}

/// Cursor over one block
pub struct BlockIterator {
    data: Bytes,
    restart_offset: usize,
    num_restarts: usize,
    cmp: InternalKeyComparator,
    /// Offset of the current entry; `restart_offset` when invalid
    current: usize,
    restart_index: usize,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    error: Option<TideError>,
}

struct EntryHeader {
    shared: usize,
    non_shared: usize,
    value_len: usize,
}

impl BlockIterator {
    fn restart_point(&self, index: usize) -> usize {
        let at = self.restart_offset + index * 4;
        (&self.data[at..at + 4]).get_u32_le() as usize
    }

    fn next_entry_offset(&self) -> usize {
        self.value_start + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_key() starts from the end of the "current value"
        self.value_start = self.restart_point(index);
        self.value_len = 0;
    }

    fn decode_header(&self, offset: usize) -> Option<EntryHeader> {
        if offset + ENTRY_HEADER_SIZE > self.restart_offset {
            return None;
        }
        let mut header = &self.data[offset..offset + ENTRY_HEADER_SIZE];
        let entry = EntryHeader {
            shared: header.get_u32_le() as usize,
            non_shared: header.get_u32_le() as usize,
            value_len: header.get_u32_le() as usize,
        };
        let body = entry.non_shared.checked_add(entry.value_len)?;
        if body > self.restart_offset - offset - ENTRY_HEADER_SIZE {
            return None;
        }
        Some(entry)
    }

    fn corruption(&mut self) {
        self.current = self.restart_offset;
        self.restart_index = self.num_restarts;
        self.key.clear();
        self.value_len = 0;
        if self.error.is_none() {
            self.error = Some(TideError::Corruption("bad entry in block".into()));
        }
    }

    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restart_offset {
            self.current = self.restart_offset;
            self.restart_index = self.num_restarts;
            return false;
        }

        let Some(entry) = self.decode_header(self.current) else {
            self.corruption();
            return false;
        };
        if entry.shared > self.key.len() {
            self.corruption();
            return false;
        }

        let key_start = self.current + ENTRY_HEADER_SIZE;
        self.key.truncate(entry.shared);
        self.key
            .extend_from_slice(&self.data[key_start..key_start + entry.non_shared]);
        self.value_start = key_start + entry.non_shared;
        self.value_len = entry.value_len;

        while self.restart_index + 1 < self.num_restarts
            && self.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    /// Full key stored at a restart point
    fn restart_key(&self, index: usize) -> Option<&[u8]> {
        let offset = self.restart_point(index);
        let entry = self.decode_header(offset)?;
        if entry.shared != 0 {
            return None;
        }
        let start = offset + ENTRY_HEADER_SIZE;
        Some(&self.data[start..start + entry.non_shared])
    }
}

impl InternalIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.current < self.restart_offset
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Last restart point whose key is < target
        let mut left = 0;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let ordering = match self.restart_key(mid) {
                Some(key) => self.cmp.compare(key, target),
                None => {
                    self.corruption();
                    return;
                }
            };
            if ordering == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.seek_to_restart_point(left);
        while self.parse_next_key() {
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.current = self.restart_offset;
                self.restart_index = self.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn value(&self) -> &[u8] {
        &self.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }
}
