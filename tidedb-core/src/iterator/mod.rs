//! Internal iterators
//!
//! Every sorted source (memtable, table block, whole table, level, merged
//! view) exposes the same bidirectional cursor over internal keys. The
//! user-facing iterator in `db::iter` sits on top and hides sequence numbers
//! and tombstones.

mod merge;
mod two_level;

pub use merge::MergingIterator;
pub use two_level::{BlockSource, TwoLevelIterator};

use crate::Result;

/// Bidirectional cursor over `(internal key, value)` pairs
pub trait InternalIterator: Send {
    /// Positioned on an entry
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Position at the first entry with key >= `target`
    fn seek(&mut self, target: &[u8]);

    /// Requires `valid()`
    fn next(&mut self);

    /// Requires `valid()`
    fn prev(&mut self);

    /// Requires `valid()`
    fn key(&self) -> &[u8];

    /// Requires `valid()`
    fn value(&self) -> &[u8];

    /// First error encountered, if any
    fn status(&self) -> Result<()>;
}

/// Iterator over nothing, optionally carrying an error
pub struct EmptyIterator {
    error: Option<crate::TideError>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self { error: None }
    }

    pub fn with_error(error: crate::TideError) -> Self {
        Self { error: Some(error) }
    }
}

impl Default for EmptyIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalIterator for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn key(&self) -> &[u8] {
        &[]
    }
    fn value(&self) -> &[u8] {
        &[]
    }
    fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::InternalIterator;
    use crate::Result;

    /// Vector-backed iterator over pre-sorted entries, for tests
    pub struct VecIterator {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
        cmp: crate::types::InternalKeyComparator,
    }

    impl VecIterator {
        pub fn new(
            cmp: crate::types::InternalKeyComparator,
            entries: Vec<(Vec<u8>, Vec<u8>)>,
        ) -> Self {
            Self {
                entries,
                pos: None,
                cmp,
            }
        }
    }

    impl InternalIterator for VecIterator {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }
        fn seek_to_first(&mut self) {
            self.pos = if self.entries.is_empty() { None } else { Some(0) };
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .iter()
                .position(|(k, _)| self.cmp.compare(k, target) != std::cmp::Ordering::Less);
        }
        fn next(&mut self) {
            self.pos = self.pos.map(|p| p + 1).filter(|p| *p < self.entries.len());
        }
        fn prev(&mut self) {
            self.pos = self.pos.and_then(|p| p.checked_sub(1));
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }
}
