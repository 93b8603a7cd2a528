//! Snapshots: pinned sequence numbers.
//!
//! A snapshot bounds a reader's view to mutations with sequence <= its
//! pin. While any snapshot is alive, compactions keep every entry a reader
//! at that sequence could still observe. Handles are `Arc`s; the list
//! holds weak references, so dropping the last handle releases the pin.

use std::sync::{Arc, Mutex, Weak};

use crate::key::SequenceNumber;

pub struct Snapshot {
    seq: SequenceNumber,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.seq
    }
}

pub struct SnapshotList {
    // Oldest first; sequence numbers are nondecreasing along the list.
    snapshots: Mutex<Vec<Weak<Snapshot>>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn create(&self, seq: SequenceNumber) -> Arc<Snapshot> {
        let snap = Arc::new(Snapshot { seq });
        let mut list = self.snapshots.lock().unwrap();
        list.push(Arc::downgrade(&snap));
        snap
    }

    /// Sequence of the oldest live snapshot, if any.
    pub fn oldest(&self) -> Option<SequenceNumber> {
        let mut list = self.snapshots.lock().unwrap();
        list.retain(|w| w.strong_count() > 0);
        list.first().and_then(|w| w.upgrade()).map(|s| s.seq)
    }

    pub fn is_empty(&self) -> bool {
        self.oldest().is_none()
    }
}

impl Default for SnapshotList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tracks_releases() {
        let list = SnapshotList::new();
        assert!(list.is_empty());

        let s1 = list.create(10);
        let s2 = list.create(20);
        let s3 = list.create(30);
        assert_eq!(list.oldest(), Some(10));

        drop(s1);
        assert_eq!(list.oldest(), Some(20));

        // Releasing out of order keeps the remaining minimum.
        drop(s3);
        assert_eq!(list.oldest(), Some(20));
        assert_eq!(s2.sequence(), 20);

        drop(s2);
        assert!(list.is_empty());
    }
}
