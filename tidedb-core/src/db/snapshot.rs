//! Point-in-time read views

use crate::types::SequenceNumber;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Sequence numbers pinned by live snapshots, with a count per sequence
#[derive(Default)]
pub(crate) struct SnapshotList {
    pinned: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, sequence: SequenceNumber) -> Snapshot {
        *self.pinned.lock().entry(sequence).or_insert(0) += 1;
        Snapshot {
            inner: Arc::new(SnapshotInner {
                sequence,
                list: self.clone(),
            }),
        }
    }

    fn release(&self, sequence: SequenceNumber) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&sequence);
            }
        }
    }

    /// Oldest sequence any snapshot can still read at
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.pinned.lock().keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.pinned.lock().values().sum()
    }
}

struct SnapshotInner {
    sequence: SequenceNumber,
    list: Arc<SnapshotList>,
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        self.list.release(self.sequence);
    }
}

/// Immutable view of the database as of one sequence number.
///
/// Clones share the same registration; the view is released when the last
/// clone is dropped or passed to [`Database::release_snapshot`](super::Database::release_snapshot).
/// Compaction keeps every entry a live snapshot can still read.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    /// Sequence number of the last write visible through this snapshot
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tracks_live_snapshots() {
        let list = Arc::new(SnapshotList::new());
        assert_eq!(list.oldest(), None);

        let s5 = list.acquire(5);
        let s9 = list.acquire(9);
        let s5b = list.acquire(5);
        assert_eq!(list.oldest(), Some(5));
        assert_eq!(list.len(), 3);

        drop(s5);
        assert_eq!(list.oldest(), Some(5));
        drop(s5b);
        assert_eq!(list.oldest(), Some(9));
        assert_eq!(s9.sequence(), 9);
        drop(s9);
        assert_eq!(list.oldest(), None);
    }

    #[test]
    fn test_clones_share_registration() {
        let list = Arc::new(SnapshotList::new());
        let snapshot = list.acquire(3);
        let copy = snapshot.clone();
        assert_eq!(list.len(), 1);
        drop(snapshot);
        assert_eq!(list.oldest(), Some(3));
        drop(copy);
        assert_eq!(list.len(), 0);
    }
}
