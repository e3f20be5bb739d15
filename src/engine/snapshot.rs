//! Pinned read points.
//!
//! A [`Snapshot`] fixes a sequence number: reads through it see exactly the
//! writes acknowledged before it was taken. While any snapshot is alive,
//! compaction keeps every version it can observe.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Multiset of pinned sequence numbers.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    pinned: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the sequence number returned by `current` and return a handle
    /// that releases it on drop.
    ///
    /// `current` runs under the registry lock, so [`Self::horizon`] never
    /// observes a read point that is taken but not yet pinned.
    pub fn acquire(self: &Arc<Self>, current: impl FnOnce() -> u64) -> Snapshot {
        let mut pinned = self.pinned.lock();
        let seq = current();
        *pinned.entry(seq).or_insert(0) += 1;
        drop(pinned);
        trace!(seq, "snapshot acquired");
        Snapshot {
            seq,
            registry: Arc::clone(self),
        }
    }

    fn release(&self, seq: u64) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&seq);
            }
        }
        trace!(seq, "snapshot released");
    }

    /// Lowest sequence number a reader may still read at: the oldest pinned
    /// snapshot, or `current()` when that is lower or nothing is pinned.
    pub fn horizon(&self, current: impl FnOnce() -> u64) -> u64 {
        let pinned = self.pinned.lock();
        let last = current();
        pinned.keys().next().map_or(last, |&seq| seq.min(last))
    }

    /// Number of live snapshot handles.
    pub fn len(&self) -> usize {
        self.pinned.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.lock().is_empty()
    }
}

/// A consistent read point. Dropping it unpins the sequence number.
#[derive(Debug)]
pub struct Snapshot {
    seq: u64,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    /// Highest sequence number visible through this snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.release(self.seq);
    }
}
