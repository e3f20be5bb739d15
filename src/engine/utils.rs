//! Engine utilities: the shared record type and the k-way merge.
//!
//! - [`Record`] — a versioned put or tombstone, the unit that flows from
//!   memtables and SSTables into scans, flushes and compactions.
//! - [`MergeIterator`] — a heap-based k-way merge that combines sorted
//!   record streams into one stream ordered by `(key ASC, seq DESC)`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::memtable::MemtableEntry;
use crate::sstable::SSTableError;

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// One version of a key.
#[derive(Debug, Clone)]
pub enum Record {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        seq: u64,
        timestamp: u64,
    },
    Delete {
        key: Vec<u8>,
        seq: u64,
        timestamp: u64,
    },
}

impl Record {
    pub fn key(&self) -> &[u8] {
        match self {
            Record::Put { key, .. } | Record::Delete { key, .. } => key,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Record::Put { seq, .. } | Record::Delete { seq, .. } => *seq,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Record::Put { timestamp, .. } | Record::Delete { timestamp, .. } => *timestamp,
        }
    }

    /// The stored value, `None` for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Record::Put { value, .. } => Some(value),
            Record::Delete { .. } => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Record::Delete { .. })
    }

    /// Approximate encoded size, used to split compaction output.
    pub fn encoded_len(&self) -> usize {
        // seq + timestamp + kind + two length prefixes
        25 + self.key().len() + self.value().map_or(0, <[u8]>::len)
    }

    pub fn from_memtable(key: Vec<u8>, entry: MemtableEntry) -> Self {
        match entry.value {
            Some(value) => Record::Put {
                key,
                value,
                seq: entry.seq,
                timestamp: entry.timestamp,
            },
            None => Record::Delete {
                key,
                seq: entry.seq,
                timestamp: entry.timestamp,
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Ord / Eq, ordering by (key ASC, seq DESC)
// ------------------------------------------------------------------------------------------------

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.seq() == other.seq()
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key().cmp(other.key()) {
            Ordering::Equal => other.seq().cmp(&self.seq()),
            ord => ord,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MergeIterator — heap-based k-way merge over Record streams
// ------------------------------------------------------------------------------------------------

/// A sorted source of records. Memtable sources never fail; SSTable sources
/// report corruption as an error item.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record, SSTableError>> + 'a>;

/// Merges any number of individually sorted streams.
///
/// The first error from any source is returned in place of the next record,
/// after which the iterator is exhausted.
pub struct MergeIterator<'a> {
    iters: Vec<RecordStream<'a>>,
    heap: BinaryHeap<MergeHeapEntry>,
    error: Option<SSTableError>,
    failed: bool,
}

struct MergeHeapEntry {
    record: Record,
    source_idx: usize,
}

impl Ord for MergeHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so smallest key / highest seq pops first.
        self.record
            .cmp(&other.record)
            .then(self.source_idx.cmp(&other.source_idx))
            .reverse()
    }
}

impl PartialOrd for MergeHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHeapEntry {}

impl<'a> MergeIterator<'a> {
    pub fn new(mut iters: Vec<RecordStream<'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(iters.len());
        let mut error = None;

        for (source_idx, iter) in iters.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok(record)) => heap.push(MergeHeapEntry { record, source_idx }),
                Some(Err(e)) => {
                    error.get_or_insert(e);
                }
                None => {}
            }
        }

        Self {
            iters,
            heap,
            error,
            failed: false,
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Record, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.error.take() {
            self.failed = true;
            return Some(Err(e));
        }

        let MergeHeapEntry { record, source_idx } = self.heap.pop()?;
        match self.iters[source_idx].next() {
            Some(Ok(next)) => self.heap.push(MergeHeapEntry {
                record: next,
                source_idx,
            }),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }
        Some(Ok(record))
    }
}
