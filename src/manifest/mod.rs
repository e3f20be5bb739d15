//! # Manifest Component
//!
//! The **Manifest** is the metadata authority of the storage engine. It
//! tracks the durable layout of the LSM tree:
//!
//! - the active WAL generation,
//! - frozen WAL generations whose memtables are not yet flushed,
//! - every live SSTable and the level it belongs to,
//! - the next SSTable id and the last durable sequence number.
//!
//! ## Durability strategy
//!
//! Metadata is persisted as an **event log + periodic snapshot**:
//!
//! 1. **Event log** (`wal-000000.log`) records one [`ManifestEvent`] per
//!    layout change. Each append is fsynced before the change is applied in
//!    memory, so the caller only ever observes durable metadata.
//! 2. **Snapshot** (`MANIFEST-000001`) is a checksummed dump of the whole
//!    state, written to a temp file, fsynced, renamed over the previous
//!    snapshot, and followed by a directory fsync. The event log is then
//!    truncated.
//! 3. On startup the snapshot (if any) is loaded and the event log is
//!    replayed on top of it. Replay is idempotent, so a crash between the
//!    rename and the log truncation is harmless.
//!
//! A corrupt snapshot is an error: once the log has been truncated the
//! snapshot is the only copy of the state.
//!
//! ## Thread safety
//!
//! One mutex covers both the in-memory state and the log append, so events
//! reach the log in the same order they are applied. Checkpoints run under
//! the same lock.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, ByteReader, Decode, Encode, EncodingError};
use crate::wal::{SyncPolicy, Wal, WalError, wal_file_name};

const SNAPSHOT_FILENAME: &str = "MANIFEST-000001";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const SNAPSHOT_MAGIC: [u8; 4] = *b"BMAN";
/// The manifest log is a single segment that never rotates.
const LOG_SEQ: u64 = 0;
/// Checkpoint automatically once this many events sit in the log.
const AUTO_CHECKPOINT_EVENTS: u64 = 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Event log failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot file is corrupted or its checksum does not match.
    #[error("Snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// An event contradicts the current state.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManifestError {
    /// Whether a commit that failed with this error may still have reached
    /// the log. Only I/O failures leave the outcome unknown; validation and
    /// encoding errors are raised before anything is written.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Wal(WalError::Io(_)))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest data structures
// ------------------------------------------------------------------------------------------------

/// An SSTable known to the manifest.
///
/// The file lives at `sst/<id>.sst`; only the id and level are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestSstEntry {
    pub id: u64,
    pub level: u32,
}

/// Durable engine layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    /// Bumped on every applied event.
    pub version: u64,
    pub last_seq: u64,
    pub active_wal: u64,
    /// Oldest first.
    pub frozen_wals: Vec<u64>,
    pub sstables: Vec<ManifestSstEntry>,
    pub next_sst_id: u64,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            version: 0,
            last_seq: 0,
            active_wal: 0,
            frozen_wals: Vec::new(),
            sstables: Vec::new(),
            next_sst_id: 1,
        }
    }
}

/// One metadata mutation, as recorded in the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEvent {
    /// WAL generation `frozen` stops taking writes; `active` takes over.
    Rotate { frozen: u64, active: u64 },

    /// The memtable of frozen WAL `wal` was written to `entry`.
    Flush {
        wal: u64,
        entry: ManifestSstEntry,
        last_seq: u64,
    },

    /// Compaction output replaces its inputs in a single step.
    Compaction {
        added: Vec<ManifestSstEntry>,
        removed: Vec<u64>,
    },

    /// Persists an SSTable id reservation.
    AllocateSstId { id: u64 },

    /// Raises the durable sequence number.
    UpdateSeq { last_seq: u64 },

    /// Frozen WAL `wal` held nothing worth flushing and is dropped.
    RetireWal { wal: u64 },
}

/// Snapshot stored in `MANIFEST-000001`: `[magic][data][crc32]`.
#[derive(Debug)]
struct ManifestSnapshot {
    data: ManifestData,
    checksum: u32,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for ManifestSstEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.level.encode_to(buf)
    }
}

impl Decode for ManifestSstEntry {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            id: reader.read_u64()?,
            level: reader.read_u32()?,
        })
    }
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        self.last_seq.encode_to(buf)?;
        self.active_wal.encode_to(buf)?;
        encoding::encode_vec(&self.frozen_wals, buf)?;
        encoding::encode_vec(&self.sstables, buf)?;
        self.next_sst_id.encode_to(buf)
    }
}

impl Decode for ManifestData {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            version: reader.read_u64()?,
            last_seq: reader.read_u64()?,
            active_wal: reader.read_u64()?,
            frozen_wals: encoding::decode_vec(reader)?,
            sstables: encoding::decode_vec(reader)?,
            next_sst_id: reader.read_u64()?,
        })
    }
}

impl Encode for ManifestEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEvent::Rotate { frozen, active } => {
                0u8.encode_to(buf)?;
                frozen.encode_to(buf)?;
                active.encode_to(buf)
            }
            ManifestEvent::Flush {
                wal,
                entry,
                last_seq,
            } => {
                1u8.encode_to(buf)?;
                wal.encode_to(buf)?;
                entry.encode_to(buf)?;
                last_seq.encode_to(buf)
            }
            ManifestEvent::Compaction { added, removed } => {
                2u8.encode_to(buf)?;
                encoding::encode_vec(added, buf)?;
                encoding::encode_vec(removed, buf)
            }
            ManifestEvent::AllocateSstId { id } => {
                3u8.encode_to(buf)?;
                id.encode_to(buf)
            }
            ManifestEvent::UpdateSeq { last_seq } => {
                4u8.encode_to(buf)?;
                last_seq.encode_to(buf)
            }
            ManifestEvent::RetireWal { wal } => {
                5u8.encode_to(buf)?;
                wal.encode_to(buf)
            }
        }
    }
}

impl Decode for ManifestEvent {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        match reader.read_u8()? {
            0 => Ok(ManifestEvent::Rotate {
                frozen: reader.read_u64()?,
                active: reader.read_u64()?,
            }),
            1 => Ok(ManifestEvent::Flush {
                wal: reader.read_u64()?,
                entry: ManifestSstEntry::decode(reader)?,
                last_seq: reader.read_u64()?,
            }),
            2 => Ok(ManifestEvent::Compaction {
                added: encoding::decode_vec(reader)?,
                removed: encoding::decode_vec(reader)?,
            }),
            3 => Ok(ManifestEvent::AllocateSstId {
                id: reader.read_u64()?,
            }),
            4 => Ok(ManifestEvent::UpdateSeq {
                last_seq: reader.read_u64()?,
            }),
            5 => Ok(ManifestEvent::RetireWal {
                wal: reader.read_u64()?,
            }),
            tag => Err(EncodingError::InvalidTag {
                tag: tag as u32,
                type_name: "ManifestEvent",
            }),
        }
    }
}

impl Encode for ManifestSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        SNAPSHOT_MAGIC.encode_to(buf)?;
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)
    }
}

impl Decode for ManifestSnapshot {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        let magic = <[u8; 4]>::decode(reader)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: u32::from_le_bytes(magic),
                type_name: "ManifestSnapshot",
            });
        }
        Ok(Self {
            data: ManifestData::decode(reader)?,
            checksum: reader.read_u32()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest core
// ------------------------------------------------------------------------------------------------

struct ManifestInner {
    data: ManifestData,
    log: Wal<ManifestEvent>,
    /// Events appended since the last checkpoint.
    pending_events: u64,
    /// In-memory state differs from the snapshot on disk.
    dirty: bool,
}

/// Persistent metadata manager.
///
/// Every mutation appends an event to the log (fsynced) and then applies it
/// in memory, under one lock.
pub struct Manifest {
    dir: PathBuf,
    inner: Mutex<ManifestInner>,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").field("dir", &self.dir).finish()
    }
}

impl Manifest {
    /// Opens (or creates) the manifest in `dir`.
    ///
    /// Loads the snapshot if present, then replays the event log. A torn
    /// final event is dropped; it was never acknowledged.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}"));
        if tmp.exists() {
            warn!(path = %tmp.display(), "removing leftover manifest snapshot temp file");
            fs::remove_file(&tmp)?;
        }

        let snapshot_path = dir.join(SNAPSHOT_FILENAME);
        let mut data = if snapshot_path.exists() {
            let data = Self::read_snapshot(&snapshot_path)?;
            debug!(path = %snapshot_path.display(), version = data.version, "loaded manifest snapshot");
            data
        } else {
            ManifestData::default()
        };

        let log = Wal::<ManifestEvent>::open(
            dir.join(wal_file_name(LOG_SEQ)),
            None,
            SyncPolicy::EveryWrite,
        )?;
        let events = log.recover()?;
        let replayed = events.len() as u64;
        for event in &events {
            Self::apply(&mut data, event)?;
        }

        info!(
            dir = %dir.display(),
            version = data.version,
            sstables = data.sstables.len(),
            frozen_wals = data.frozen_wals.len(),
            replayed,
            "manifest opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(ManifestInner {
                data,
                log,
                pending_events: replayed,
                dirty: replayed > 0,
            }),
        })
    }

    // --------------------------------------------------------------------
    // Read accessors
    // --------------------------------------------------------------------

    /// Copy of the full state.
    pub fn data(&self) -> ManifestData {
        self.inner.lock().data.clone()
    }

    pub fn active_wal(&self) -> u64 {
        self.inner.lock().data.active_wal
    }

    pub fn frozen_wals(&self) -> Vec<u64> {
        self.inner.lock().data.frozen_wals.clone()
    }

    pub fn sstables(&self) -> Vec<ManifestSstEntry> {
        self.inner.lock().data.sstables.clone()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().data.last_seq
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().data.version
    }

    pub fn peek_next_sst_id(&self) -> u64 {
        self.inner.lock().data.next_sst_id
    }

    /// `true` if the in-memory state has diverged from the snapshot.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    // --------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------

    /// Reserve a fresh SSTable id. Ids are never reused, even across crashes.
    pub fn allocate_sst_id(&self) -> Result<u64, ManifestError> {
        let mut inner = self.inner.lock();
        let id = inner.data.next_sst_id;
        self.commit(&mut inner, ManifestEvent::AllocateSstId { id })?;
        Ok(id)
    }

    /// Record that `frozen` was frozen and `active` now takes writes.
    pub fn record_rotation(&self, frozen: u64, active: u64) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        self.commit(&mut inner, ManifestEvent::Rotate { frozen, active })
    }

    /// Record a completed flush: the frozen WAL is retired and its table
    /// joins level 0.
    pub fn record_flush(
        &self,
        wal: u64,
        entry: ManifestSstEntry,
        last_seq: u64,
    ) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        self.commit(
            &mut inner,
            ManifestEvent::Flush {
                wal,
                entry,
                last_seq,
            },
        )
    }

    /// Atomically replace `removed` tables with `added` ones.
    pub fn apply_compaction(
        &self,
        added: Vec<ManifestSstEntry>,
        removed: Vec<u64>,
    ) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        self.commit(&mut inner, ManifestEvent::Compaction { added, removed })
    }

    /// Drop frozen WAL `wal` without producing a table.
    pub fn retire_wal(&self, wal: u64) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        self.commit(&mut inner, ManifestEvent::RetireWal { wal })
    }

    pub fn update_last_seq(&self, last_seq: u64) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        if last_seq <= inner.data.last_seq {
            return Ok(());
        }
        self.commit(&mut inner, ManifestEvent::UpdateSeq { last_seq })
    }

    /// Write a snapshot of the current state and truncate the event log.
    pub fn checkpoint(&self) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        self.checkpoint_locked(&mut inner)
    }

    // --------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------

    /// Validate against a scratch copy, append durably, then apply.
    fn commit(&self, inner: &mut ManifestInner, event: ManifestEvent) -> Result<(), ManifestError> {
        let mut next = inner.data.clone();
        Self::apply(&mut next, &event)?;

        inner.log.append_sync(&event)?;
        inner.data = next;
        inner.pending_events += 1;
        inner.dirty = true;
        debug!(?event, version = inner.data.version, "manifest event committed");

        if inner.pending_events >= AUTO_CHECKPOINT_EVENTS {
            if let Err(e) = self.checkpoint_locked(inner) {
                // The event itself is durable in the log.
                warn!(error = %e, "automatic manifest checkpoint failed");
            }
        }
        Ok(())
    }

    fn checkpoint_locked(&self, inner: &mut ManifestInner) -> Result<(), ManifestError> {
        let mut snapshot = ManifestSnapshot {
            data: inner.data.clone(),
            checksum: 0,
        };
        let bytes = encoding::encode_to_vec(&snapshot)?;
        snapshot.checksum = crc32fast::hash(&bytes[..bytes.len() - 4]);
        let bytes = encoding::encode_to_vec(&snapshot)?;

        let tmp_path = self
            .dir
            .join(format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}"));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }

        let final_path = self.dir.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        inner.log.truncate()?;
        inner.pending_events = 0;
        inner.dirty = false;

        info!(version = inner.data.version, path = %final_path.display(), "manifest checkpoint written");
        Ok(())
    }

    fn read_snapshot(path: &Path) -> Result<ManifestData, ManifestError> {
        let bytes = fs::read(path)?;
        if bytes.len() < 4 {
            return Err(ManifestError::SnapshotChecksumMismatch);
        }
        let (body, _) = bytes.split_at(bytes.len() - 4);
        let snapshot = encoding::decode_exact::<ManifestSnapshot>(&bytes)
            .map_err(|_| ManifestError::SnapshotChecksumMismatch)?;
        if snapshot.checksum != crc32fast::hash(body) {
            return Err(ManifestError::SnapshotChecksumMismatch);
        }
        Ok(snapshot.data)
    }

    /// Applies `event` to `data`. Every event is idempotent.
    fn apply(data: &mut ManifestData, event: &ManifestEvent) -> Result<(), ManifestError> {
        match event {
            ManifestEvent::Rotate { frozen, active } => {
                if active <= frozen {
                    return Err(ManifestError::Internal(format!(
                        "rotation to WAL {active} does not follow {frozen}"
                    )));
                }
                if !data.frozen_wals.contains(frozen) {
                    data.frozen_wals.push(*frozen);
                }
                data.active_wal = data.active_wal.max(*active);
            }

            ManifestEvent::Flush {
                wal,
                entry,
                last_seq,
            } => {
                data.frozen_wals.retain(|w| w != wal);
                if !data.sstables.iter().any(|e| e.id == entry.id) {
                    data.sstables.push(*entry);
                }
                data.next_sst_id = data.next_sst_id.max(entry.id + 1);
                data.last_seq = data.last_seq.max(*last_seq);
            }

            ManifestEvent::Compaction { added, removed } => {
                data.sstables.retain(|e| !removed.contains(&e.id));
                for entry in added {
                    if !data.sstables.iter().any(|e| e.id == entry.id) {
                        data.sstables.push(*entry);
                    }
                    data.next_sst_id = data.next_sst_id.max(entry.id + 1);
                }
            }

            ManifestEvent::AllocateSstId { id } => {
                data.next_sst_id = data.next_sst_id.max(id + 1);
            }

            ManifestEvent::UpdateSeq { last_seq } => {
                data.last_seq = data.last_seq.max(*last_seq);
            }

            ManifestEvent::RetireWal { wal } => {
                data.frozen_wals.retain(|w| w != wal);
            }
        }
        data.version += 1;
        Ok(())
    }
}
