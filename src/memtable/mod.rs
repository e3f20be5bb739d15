//! # Memtable Module
//!
//! The mutable, in-memory layer of the LSM tree, paired one-to-one with a
//! WAL segment.
//!
//! Every [`Memtable::put`] and [`Memtable::delete`] is appended to the
//! memtable's own WAL segment **before** it touches the in-memory tree, and
//! the tree's write lock is taken only for the insert itself. If the WAL
//! append fails the tree is left unchanged.
//!
//! Each key maps to all of its versions, ordered by sequence number, so
//! snapshot reads and compaction can see history. When the memtable grows
//! past the write buffer the engine calls [`Memtable::freeze`], a one-way
//! transition after which every mutation is rejected with
//! [`MemtableError::Frozen`]; the resulting [`FrozenMemtable`] is shared
//! read-only by readers and the flush worker.
//!
//! ## Crash Safety
//!
//! [`Memtable::open`] replays the segment through [`Wal::recover`], so a
//! torn tail left by a crash is dropped and the table is rebuilt from the
//! acknowledged prefix.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    ops::{Bound, Deref},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::encoding::{self, ByteReader, Decode, Encode, EncodingError};
use crate::wal::{SyncPolicy, Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Bookkeeping charged per version on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Represents possible errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL failure. The in-memory tree was not modified.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// The memtable has been frozen and no longer accepts writes.
    #[error("Memtable is frozen")]
    Frozen,
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// A single version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableEntry {
    /// The stored value. `None` is a tombstone.
    pub value: Option<Vec<u8>>,

    /// Global sequence number.
    pub seq: u64,

    /// Wall-clock time of the write, nanoseconds since UNIX epoch.
    pub timestamp: u64,
}

impl MemtableEntry {
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// The WAL payload for one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableRecord {
    pub key: Vec<u8>,
    pub entry: MemtableEntry,
}

impl Encode for MemtableRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.entry.seq.encode_to(buf)?;
        self.entry.timestamp.encode_to(buf)?;
        encoding::encode_bytes(&self.key, buf)?;
        self.entry.value.encode_to(buf)
    }
}

impl Decode for MemtableRecord {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        let seq = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let key = reader.read_bytes()?.to_vec();
        let value = Option::<Vec<u8>>::decode(reader)?;
        Ok(Self {
            key,
            entry: MemtableEntry {
                value,
                seq,
                timestamp,
            },
        })
    }
}

/// Outcome of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGetResult {
    Put { value: Vec<u8>, seq: u64 },
    Delete { seq: u64 },
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// An in-memory, WAL-backed, multi-version sorted map.
pub struct Memtable {
    /// Key → versions in ascending sequence order.
    tree: RwLock<BTreeMap<Vec<u8>, Vec<MemtableEntry>>>,

    wal: Wal<MemtableRecord>,

    approximate_size: AtomicUsize,
    entry_count: AtomicUsize,
    max_seq: AtomicU64,
    frozen: AtomicBool,
}

impl Memtable {
    /// Open the memtable for the WAL segment at `wal_path`, replaying any
    /// records it already holds.
    pub fn open<P: AsRef<Path>>(
        wal_path: P,
        max_record_size: Option<u32>,
        sync_policy: SyncPolicy,
    ) -> Result<Self, MemtableError> {
        let wal = Wal::open(&wal_path, max_record_size, sync_policy)?;
        Self::from_wal(wal)
    }

    /// Start an empty memtable on the WAL segment following this one.
    pub fn next_generation(&self) -> Result<Self, MemtableError> {
        Self::from_wal(self.wal.rotate_next()?)
    }

    fn from_wal(wal: Wal<MemtableRecord>) -> Result<Self, MemtableError> {
        let records = wal.recover()?;

        let memtable = Self {
            tree: RwLock::new(BTreeMap::new()),
            wal,
            approximate_size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        };

        let replayed = records.len();
        for record in records {
            memtable.insert(record.key, record.entry);
        }

        if replayed > 0 {
            info!(
                wal_seq = memtable.wal.seq(),
                records = replayed,
                max_seq = memtable.max_seq(),
                "memtable rebuilt from WAL"
            );
        } else {
            debug!(wal_seq = memtable.wal.seq(), "opened empty memtable");
        }

        Ok(memtable)
    }

    /// Insert `value` for `key` at sequence number `seq`.
    ///
    /// An empty value is a regular value, distinct from a tombstone.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> Result<(), MemtableError> {
        trace!(seq, key = %HexKey(&key), "memtable put");
        self.write(key, Some(value), seq)
    }

    /// Insert a tombstone for `key` at sequence number `seq`.
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> Result<(), MemtableError> {
        trace!(seq, key = %HexKey(&key), "memtable delete");
        self.write(key, None, seq)
    }

    fn write(&self, key: Vec<u8>, value: Option<Vec<u8>>, seq: u64) -> Result<(), MemtableError> {
        if self.is_frozen() {
            return Err(MemtableError::Frozen);
        }

        let record = MemtableRecord {
            key,
            entry: MemtableEntry {
                value,
                seq,
                timestamp: current_timestamp(),
            },
        };

        // 1. WAL first (crash safety)
        self.wal.append(&record)?;

        // 2. In-memory update
        self.insert(record.key, record.entry);
        Ok(())
    }

    /// Apply a group of mutations with one WAL append and one sync.
    ///
    /// Sequence numbers are handed out from `first_seq` to the mutations
    /// whose record fits the WAL, in order; a mutation that is rejected gets
    /// its own error and consumes no sequence number. The outer error means
    /// the WAL append itself failed and nothing was applied.
    pub fn write_batch(
        &self,
        writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
        first_seq: u64,
    ) -> Result<Vec<Result<u64, MemtableError>>, MemtableError> {
        if self.is_frozen() {
            return Err(MemtableError::Frozen);
        }

        let timestamp = current_timestamp();
        let mut next_seq = first_seq;
        let mut frames = Vec::with_capacity(writes.len());
        let mut accepted = Vec::with_capacity(writes.len());
        let mut outcomes = Vec::with_capacity(writes.len());
        for (key, value) in writes {
            let record = MemtableRecord {
                key,
                entry: MemtableEntry {
                    value,
                    seq: next_seq,
                    timestamp,
                },
            };
            match self.wal.encode_frame(&record) {
                Ok(frame) => {
                    frames.push(frame);
                    accepted.push(record);
                    outcomes.push(Ok(next_seq));
                    next_seq += 1;
                }
                Err(e) => outcomes.push(Err(e.into())),
            }
        }

        self.wal.append_frames(&frames)?;
        trace!(first_seq, applied = accepted.len(), "memtable batch");
        for record in accepted {
            self.insert(record.key, record.entry);
        }
        Ok(outcomes)
    }

    fn insert(&self, key: Vec<u8>, entry: MemtableEntry) {
        let size = ENTRY_OVERHEAD + key.len() + entry.value.as_ref().map_or(0, Vec::len);
        let seq = entry.seq;

        let mut tree = self.tree.write();
        let versions = tree.entry(key).or_default();
        match versions.last() {
            Some(last) if last.seq > seq => {
                let pos = versions.partition_point(|e| e.seq < seq);
                versions.insert(pos, entry);
            }
            _ => versions.push(entry),
        }
        drop(tree);

        self.approximate_size.fetch_add(size, Ordering::Relaxed);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Newest version of `key`.
    pub fn get(&self, key: &[u8]) -> MemtableGetResult {
        self.get_at(key, u64::MAX)
    }

    /// Newest version of `key` with a sequence number `<= read_seq`.
    pub fn get_at(&self, key: &[u8], read_seq: u64) -> MemtableGetResult {
        let tree = self.tree.read();
        let Some(versions) = tree.get(key) else {
            return MemtableGetResult::NotFound;
        };
        match versions.iter().rev().find(|e| e.seq <= read_seq) {
            Some(MemtableEntry {
                value: Some(value),
                seq,
                ..
            }) => MemtableGetResult::Put {
                value: value.clone(),
                seq: *seq,
            },
            Some(MemtableEntry {
                value: None, seq, ..
            }) => MemtableGetResult::Delete { seq: *seq },
            None => MemtableGetResult::NotFound,
        }
    }

    /// Versions with `seq <= read_seq` of keys within the bounds, ordered by
    /// key ascending and then sequence number descending.
    pub fn scan(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        read_seq: u64,
    ) -> Vec<(Vec<u8>, MemtableEntry)> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (key, versions) in tree.range::<[u8], _>((start, end)) {
            for entry in versions.iter().rev().filter(|e| e.seq <= read_seq) {
                out.push((key.clone(), entry.clone()));
            }
        }
        out
    }

    /// Every version in flush order.
    pub fn iter_for_flush(&self) -> Vec<(Vec<u8>, MemtableEntry)> {
        self.scan(Bound::Unbounded, Bound::Unbounded, u64::MAX)
    }

    /// One-way transition to read-only; returns the shareable frozen view.
    pub fn freeze(self: Arc<Self>) -> FrozenMemtable {
        if !self.frozen.swap(true, Ordering::AcqRel) {
            debug!(
                wal_seq = self.wal.seq(),
                entries = self.len(),
                size = self.approximate_size(),
                "memtable frozen"
            );
        }
        FrozenMemtable(self)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Number of stored versions.
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest sequence number inserted, 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Acquire)
    }

    pub fn wal_seq(&self) -> u64 {
        self.wal.seq()
    }

    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    pub fn sync_wal(&self) -> Result<(), MemtableError> {
        Ok(self.wal.sync()?)
    }

    pub fn sync_wal_if_due(&self) -> Result<(), MemtableError> {
        Ok(self.wal.sync_if_due()?)
    }

    pub fn wal_is_poisoned(&self) -> bool {
        self.wal.is_poisoned()
    }
}

// ------------------------------------------------------------------------------------------------
// FrozenMemtable
// ------------------------------------------------------------------------------------------------

/// A memtable that no longer accepts writes.
///
/// Cheap to clone; every clone shares the same tree and WAL segment.
#[derive(Clone)]
pub struct FrozenMemtable(Arc<Memtable>);

impl Deref for FrozenMemtable {
    type Target = Memtable;

    fn deref(&self) -> &Memtable {
        &self.0
    }
}

impl std::fmt::Debug for FrozenMemtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenMemtable")
            .field("wal_seq", &self.wal_seq())
            .field("entries", &self.len())
            .field("max_seq", &self.max_seq())
            .finish()
    }
}

/// Nanoseconds since the UNIX epoch, or 0 if the clock is before it.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Hex rendering of a key for log fields; long keys are shortened.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl std::fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
