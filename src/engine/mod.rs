//! # LSM Storage Engine
//!
//! This module implements a **synchronous**, **crash-safe** LSM-tree storage
//! engine with multi-version reads and leveled background compaction.
//!
//! ## Design Overview
//!
//! The engine organises data across three layers, queried newest-first:
//!
//! 1. **Active memtable** — an in-memory sorted map backed by a WAL segment.
//! 2. **Frozen memtables** — read-only memtables awaiting flush, each still
//!    backed by its own WAL segment.
//! 3. **SSTables** — immutable on-disk files organised in levels by a
//!    [`Version`]. Level 0 holds flushed tables (newest first, possibly
//!    overlapping); deeper levels are non-overlapping sorted runs.
//!
//! Writes go through the WAL first, then into the active memtable. When the
//! memtable reaches [`EngineConfig::write_buffer_size`] it is frozen and a
//! fresh memtable on the next WAL generation takes over. Frozen memtables
//! are written to level 0 by [`Engine::flush_oldest_frozen`]; compaction
//! then pushes data down the levels.
//!
//! ## Concurrency Model
//!
//! - Readers clone an `Arc<LsmState>` under a briefly held read lock and
//!   work on that snapshot; a rotation, flush or compaction install is
//!   either fully visible to them or not at all.
//! - Writers serialize on a dedicated writer mutex that covers sequence
//!   assignment, the WAL append, the memtable insert and rotation. Each
//!   writer first joins a commit queue; whoever holds the mutex commits the
//!   whole queue with one WAL append and one sync, so writers that arrive
//!   during an `fsync` share the next one.
//! - Flushes and compactions each run behind their own mutex and publish
//!   their results by swapping in a new `LsmState`.
//! - When too many memtables are waiting for flush, writers block on a
//!   condition variable until a flush completes or their deadline passes.
//!
//! ## Guarantees
//!
//! - **Durability:** a write is acknowledged only after its WAL append
//!   succeeded (and synced, per [`SyncPolicy`]).
//! - **Crash recovery:** [`Engine::open`] replays the manifest, opens live
//!   SSTables, removes orphaned files and rebuilds memtables from their WAL
//!   segments.
//! - **Recency:** the highest sequence number of a key always wins, wherever
//!   it is stored.

use std::{
    collections::HashSet,
    fs, io, mem,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::compaction::{
    self, CompactionError, CompactionPhase, CompactionStrategy, CompactionTask, LeveledPolicy,
    MergeOptions, PhaseTracker, throttle::RateLimiter,
};
use crate::manifest::{Manifest, ManifestError, ManifestSstEntry};
use crate::memtable::{FrozenMemtable, HexKey, Memtable, MemtableError, MemtableGetResult};
use crate::sstable::{
    self, GetResult, SSTable, SSTableError, SstWriter, SstWriterOptions, sst_file_name,
};
use crate::wal::{self, SyncPolicy};

pub mod snapshot;
pub mod utils;
pub mod version;
mod visibility;

pub use snapshot::{Snapshot, SnapshotRegistry};
pub use utils::{MergeIterator, Record, RecordStream};
pub use version::Version;
pub use visibility::VisibilityFilter;

#[cfg(test)]
mod tests;

pub const MANIFEST_DIR: &str = "manifest";
pub const WAL_DIR: &str = "wal";
pub const SST_DIR: &str = "sst";

/// A single key-value pair returned by scans.
pub type KeyValue = (Vec<u8>, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the manifest subsystem.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error originating from the memtable (or its WAL).
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// A background merge failed.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// A specific table failed while serving a point read.
    #[error("SSTable {id} failed reading key {}: {source}", HexKey(.key))]
    Table {
        id: u64,
        key: Vec<u8>,
        source: SSTableError,
    },

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Background work failed repeatedly; writes are refused.
    #[error("engine is read-only after repeated background failures")]
    ReadOnly,

    /// The deadline passed while waiting for a lock.
    #[error("operation timed out")]
    Timeout,

    /// The deadline passed while writes were stalled on pending flushes.
    #[error("write stalled: too many memtables waiting for flush")]
    WriteStall,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance. Built from the public
/// `DbConfig`; values are assumed validated.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memtable size (bytes) that triggers a rotation.
    pub write_buffer_size: usize,
    pub sync_policy: SyncPolicy,
    /// Largest encoded WAL record accepted by new segments.
    pub max_record_size: u32,
    /// Writers stall once this many memtables wait for flush.
    pub max_frozen_memtables: usize,

    pub max_levels: usize,
    pub level0_compaction_trigger: usize,
    pub level_base_size: u64,
    pub level_size_multiplier: u64,

    pub target_file_size: u64,
    pub block_size: usize,
    /// Bloom filter density; 0 disables filters.
    pub bloom_bits_per_key: usize,
    /// Minimum age before a bottom-level tombstone may be dropped.
    pub tombstone_retention: Duration,
    /// Compaction write budget in bytes per second; `None` is unthrottled.
    pub compaction_rate_limit: Option<u64>,

    pub background_retry_limit: u32,
    /// Delay before the first retry; doubled on every further attempt.
    pub background_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            sync_policy: SyncPolicy::EveryWrite,
            max_record_size: 17 * 1024 * 1024,
            max_frozen_memtables: 4,
            max_levels: 7,
            level0_compaction_trigger: 4,
            level_base_size: 64 * 1024 * 1024,
            level_size_multiplier: 10,
            target_file_size: 8 * 1024 * 1024,
            block_size: 4096,
            bloom_bits_per_key: 10,
            tombstone_retention: Duration::from_secs(3600),
            compaction_rate_limit: None,
            background_retry_limit: 3,
            background_retry_backoff: Duration::from_millis(100),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

/// Everything a reader needs, published as one unit.
#[derive(Clone)]
struct LsmState {
    active: Arc<Memtable>,
    /// Newest first.
    frozen: Vec<FrozenMemtable>,
    version: Arc<Version>,
}

impl LsmState {
    /// Memtables in lookup order: active, then frozen newest first.
    fn memtables(&self) -> impl Iterator<Item = &Memtable> {
        std::iter::once(&*self.active).chain(self.frozen.iter().map(|f| &**f))
    }
}

/// Background work items dispatched to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    /// Write the oldest frozen memtable to level 0.
    Flush,
    /// Run compaction rounds until the tree is in shape.
    Compact,
}

/// Size of one level in [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
    pub files: usize,
    pub bytes: u64,
}

/// Point-in-time statistics returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Number of frozen memtables pending flush.
    pub frozen_count: usize,
    /// Approximate size of the active memtable in bytes.
    pub active_memtable_size: usize,
    /// One entry per level, level 0 first.
    pub levels: Vec<LevelStats>,
    pub compaction_phase: CompactionPhase,
    /// Sequence number of the last acknowledged write.
    pub last_seq: u64,
    pub read_only: bool,
    pub live_snapshots: usize,
}

impl EngineStats {
    pub fn sstables_count(&self) -> usize {
        self.levels.iter().map(|l| l.files).sum()
    }

    pub fn total_sst_size_bytes(&self) -> u64 {
        self.levels.iter().map(|l| l.bytes).sum()
    }
}

struct EngineInner {
    data_dir: PathBuf,
    sst_dir: PathBuf,
    config: EngineConfig,
    policy: LeveledPolicy,
    merge_options: MergeOptions,

    /// Persistent metadata: live tables, WAL generations, id counter.
    manifest: Manifest,

    state: RwLock<Arc<LsmState>>,

    /// Serializes the write path.
    writer: Mutex<()>,
    /// Writes waiting for the next holder of `writer` to commit them.
    commit_queue: Mutex<Vec<Arc<PendingWrite>>>,
    /// Signalled whenever a flush retires a frozen memtable.
    flushed: Condvar,
    /// Sequence number of the last acknowledged write.
    last_seq: AtomicU64,

    snapshots: Arc<SnapshotRegistry>,

    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    phase: PhaseTracker,

    read_only: AtomicBool,
}

/// One mutation waiting in the commit queue.
struct PendingWrite {
    write: Mutex<Option<(Vec<u8>, Option<Vec<u8>>)>>,
    outcome: Mutex<Option<Result<(), EngineError>>>,
}

impl PendingWrite {
    fn new(key: Vec<u8>, value: Option<Vec<u8>>) -> Self {
        Self {
            write: Mutex::new(Some((key, value))),
            outcome: Mutex::new(None),
        }
    }

    fn take_write(&self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.write.lock().take()
    }

    fn complete(&self, outcome: Result<(), EngineError>) {
        *self.outcome.lock() = Some(outcome);
    }

    fn take_outcome(&self) -> Option<Result<bool, EngineError>> {
        self.outcome
            .lock()
            .take()
            .map(|outcome| outcome.map(|()| false))
    }
}

/// The main LSM storage engine handle.
///
/// Cheap to clone; every clone shares the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.inner.data_dir)
            .field("last_seq", &self.last_seq())
            .finish_non_exhaustive()
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at the given directory.
    ///
    /// Recovery runs in this order:
    ///
    /// 1. Load the manifest (snapshot + event log).
    /// 2. Remove SSTables, temp files and WAL segments it does not reference.
    /// 3. Open the live SSTables and assemble the [`Version`].
    /// 4. Replay frozen WAL segments (oldest first), then the active one.
    /// 5. Continue sequence numbers after the highest one seen anywhere.
    ///
    /// Frozen memtables rebuilt here still need a flush; see
    /// [`Engine::frozen_count`].
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let data_dir = path.as_ref().to_path_buf();
        let manifest_dir = data_dir.join(MANIFEST_DIR);
        let wal_dir = data_dir.join(WAL_DIR);
        let sst_dir = data_dir.join(SST_DIR);

        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&sst_dir)?;

        // 1. Manifest
        let manifest = Manifest::open(&manifest_dir)?;
        let data = manifest.data();

        // 2. Orphans
        let live_tables: HashSet<u64> = data.sstables.iter().map(|e| e.id).collect();
        let mut live_wals: HashSet<u64> = data.frozen_wals.iter().copied().collect();
        live_wals.insert(data.active_wal);
        remove_orphan_tables(&sst_dir, &live_tables)?;
        remove_orphan_wals(&wal_dir, &live_wals)?;

        // 3. SSTables
        let mut tables = Vec::with_capacity(data.sstables.len());
        for entry in &data.sstables {
            if entry.level as usize >= config.max_levels {
                return Err(EngineError::Internal(format!(
                    "table {} is on level {} but only {} levels are configured",
                    entry.id, entry.level, config.max_levels
                )));
            }
            let table = SSTable::open(sst_dir.join(sst_file_name(entry.id)), entry.id)
                .inspect_err(|e| error!(id = entry.id, error = %e, "failed to open live SSTable"))?;
            tables.push((entry.level, Arc::new(table)));
        }
        let max_table_seq = tables.iter().map(|(_, t)| t.max_seq()).max().unwrap_or(0);
        let version = Version::from_tables(config.max_levels, tables);

        // 4. Memtables
        let mut frozen_wals = data.frozen_wals.clone();
        frozen_wals.sort_unstable();
        let mut frozen = Vec::with_capacity(frozen_wals.len());
        for wal_seq in frozen_wals {
            let memtable = Memtable::open(
                wal_dir.join(wal::wal_file_name(wal_seq)),
                Some(config.max_record_size),
                config.sync_policy,
            )?;
            frozen.push(Arc::new(memtable).freeze());
        }
        frozen.reverse();

        let active = Memtable::open(
            wal_dir.join(wal::wal_file_name(data.active_wal)),
            Some(config.max_record_size),
            config.sync_policy,
        )?;

        // 5. Sequence numbers
        let last_seq = frozen
            .iter()
            .map(|f| f.max_seq())
            .chain([data.last_seq, active.max_seq(), max_table_seq])
            .max()
            .unwrap_or(0);

        info!(
            path = %data_dir.display(),
            sstables = version.table_count(),
            frozen = frozen.len(),
            active_wal = active.wal_seq(),
            last_seq,
            "engine opened"
        );

        let policy = LeveledPolicy {
            level0_compaction_trigger: config.level0_compaction_trigger,
            level_base_size: config.level_base_size,
            level_size_multiplier: config.level_size_multiplier,
        };
        let merge_options = MergeOptions {
            target_file_size: config.target_file_size,
            block_size: config.block_size,
            bloom_bits_per_key: config.bloom_bits_per_key,
            tombstone_retention: config.tombstone_retention,
            rate_limiter: config
                .compaction_rate_limit
                .map(|bps| Arc::new(RateLimiter::new(bps))),
        };

        let state = LsmState {
            active: Arc::new(active),
            frozen,
            version: Arc::new(version),
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                data_dir,
                sst_dir,
                config,
                policy,
                merge_options,
                manifest,
                state: RwLock::new(Arc::new(state)),
                writer: Mutex::new(()),
                commit_queue: Mutex::new(Vec::new()),
                flushed: Condvar::new(),
                last_seq: AtomicU64::new(last_seq),
                snapshots: Arc::new(SnapshotRegistry::new()),
                flush_lock: Mutex::new(()),
                compaction_lock: Mutex::new(()),
                phase: PhaseTracker::new(),
                read_only: AtomicBool::new(false),
            }),
        })
    }

    /// Gracefully shuts down the engine.
    ///
    /// Freezes and flushes every memtable (unless the engine is read-only),
    /// syncs the active WAL, checkpoints the manifest and fsyncs all
    /// directories. Background workers must already be stopped.
    pub fn close(&self) -> Result<(), EngineError> {
        let inner = &self.inner;

        if !self.is_read_only() {
            self.flush_all()?;
        }

        inner.current().active.sync_wal()?;
        inner.manifest.update_last_seq(self.last_seq())?;
        inner.manifest.checkpoint()?;

        for dir in [MANIFEST_DIR, WAL_DIR, SST_DIR] {
            sync_dir(&inner.data_dir.join(dir))?;
        }
        sync_dir(&inner.data_dir)?;

        info!(path = %inner.data_dir.display(), last_seq = self.last_seq(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Insert or overwrite `key`.
    ///
    /// Returns `Ok(true)` if the active memtable was rotated (caller should
    /// schedule a flush), `Ok(false)` otherwise.
    pub fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<bool, EngineError> {
        trace!(key = %HexKey(&key), value_len = value.len(), "engine put");
        self.write(key, Some(value), deadline)
    }

    /// Write a tombstone for `key`.
    ///
    /// Returns `Ok(true)` if the active memtable was rotated.
    pub fn delete(&self, key: Vec<u8>, deadline: Option<Instant>) -> Result<bool, EngineError> {
        trace!(key = %HexKey(&key), "engine delete");
        self.write(key, None, deadline)
    }

    /// Queue the mutation, then either find it committed by another writer
    /// or take the writer lock and commit everything queued so far as one
    /// group. A write that times out before a group picks it up is withdrawn
    /// and never applied.
    fn write(
        &self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        deadline: Option<Instant>,
    ) -> Result<bool, EngineError> {
        let inner = &self.inner;
        inner.check_writable()?;

        let pending = Arc::new(PendingWrite::new(key, value));
        inner.commit_queue.lock().push(Arc::clone(&pending));

        let mut guard = match inner.lock_writer(deadline) {
            Ok(guard) => guard,
            Err(e) => {
                if inner.withdraw(&pending) {
                    return Err(e);
                }
                // Already taken by a group; its outcome lands before the lock is released.
                let _guard = inner.writer.lock();
                return pending.take_outcome().unwrap_or(Err(e));
            }
        };
        if let Some(outcome) = pending.take_outcome() {
            return outcome;
        }

        if let Err(e) = inner.wait_for_room(&mut guard, deadline) {
            return match pending.take_outcome() {
                Some(outcome) => outcome,
                None => {
                    inner.withdraw(&pending);
                    Err(e)
                }
            };
        }
        if let Some(outcome) = pending.take_outcome() {
            return outcome;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            inner.withdraw(&pending);
            return Err(EngineError::Timeout);
        }

        // From here on every queued write runs to completion.
        let rotated = inner.commit_group(&guard);
        pending
            .take_outcome()
            .unwrap_or_else(|| Err(EngineError::Internal("write left uncommitted".into())))
            .map(|_| rotated)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Look up the newest version of `key`.
    pub fn get(&self, key: &[u8], deadline: Option<Instant>) -> Result<Option<Vec<u8>>, EngineError> {
        self.get_at(key, u64::MAX, deadline)
    }

    /// Look up `key` as of sequence number `read_seq`.
    ///
    /// The lookup order is: active memtable → frozen memtables (newest
    /// first) → level-0 tables (newest first) → one table per deeper
    /// level. The first version found wins; a tombstone means `None`.
    pub fn get_at(
        &self,
        key: &[u8],
        read_seq: u64,
        deadline: Option<Instant>,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        trace!(key = %HexKey(key), read_seq, "engine get");
        let state = self.inner.current_until(deadline)?;

        for memtable in state.memtables() {
            match memtable.get_at(key, read_seq) {
                MemtableGetResult::Put { value, .. } => return Ok(Some(value)),
                MemtableGetResult::Delete { .. } => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
        }

        for table in state.version.candidates_for_key(key) {
            let found = table
                .get(key, read_seq)
                .map_err(|source| EngineError::Table {
                    id: table.id(),
                    key: key.to_vec(),
                    source,
                })?;
            match found {
                GetResult::Put { value, .. } => return Ok(Some(value)),
                GetResult::Delete { .. } => return Ok(None),
                GetResult::NotFound => {}
            }
        }

        Ok(None)
    }

    /// Live pairs in `[start, end)` as of `read_seq`, sorted by key.
    ///
    /// Every layer is merged through a [`MergeIterator`] and filtered by a
    /// [`VisibilityFilter`]. Memtable ranges are copied out up front; table
    /// iterators hold their own `Arc`, so nothing borrows engine state.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        read_seq: u64,
        deadline: Option<Instant>,
    ) -> Result<Vec<KeyValue>, EngineError> {
        trace!(start = %HexKey(start), end = %HexKey(end), read_seq, "engine scan");
        if start >= end {
            return Ok(Vec::new());
        }
        let state = self.inner.current_until(deadline)?;
        let lower = Bound::Included(start);
        let upper = Bound::Excluded(end);

        let mut sources: Vec<RecordStream<'static>> = Vec::new();
        for memtable in state.memtables() {
            let records = memtable.scan(lower, upper, read_seq);
            sources.push(Box::new(records.into_iter().map(|(key, entry)| {
                Ok::<_, SSTableError>(Record::from_memtable(key, entry))
            })));
        }
        for table in state.version.all_tables().filter(|t| t.overlaps(start, end)) {
            sources.push(Box::new(table.scan(lower, upper).filter(move |item| {
                item.as_ref().map_or(true, |record| record.seq() <= read_seq)
            })));
        }

        let visible = VisibilityFilter::new(MergeIterator::new(sources));
        Ok(visible.collect::<Result<Vec<_>, _>>()?)
    }

    /// Pin the current sequence number for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        let last_seq = &self.inner.last_seq;
        self.inner
            .snapshots
            .acquire(|| last_seq.load(Ordering::Acquire))
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Flush the oldest frozen memtable to a new level-0 SSTable.
    ///
    /// Returns `Ok(true)` if a frozen memtable was retired, `Ok(false)` if
    /// there was nothing to flush.
    ///
    /// Order of effects: table written and synced → manifest `Flush` event
    /// → new state published → WAL segment deleted. A crash at any point
    /// leaves either the WAL or the recorded table, never neither.
    pub fn flush_oldest_frozen(&self) -> Result<bool, EngineError> {
        let inner = &self.inner;
        let _flush = inner.flush_lock.lock();

        let Some(frozen) = inner.current().frozen.last().cloned() else {
            return Ok(false);
        };
        let wal_seq = frozen.wal_seq();

        let table = if frozen.is_empty() {
            inner.manifest.retire_wal(wal_seq)?;
            debug!(wal_seq, "retired empty frozen memtable");
            None
        } else {
            let table = inner.write_level0(&frozen)?;
            if let Err(e) = inner.manifest.record_flush(
                wal_seq,
                ManifestSstEntry {
                    id: table.id(),
                    level: 0,
                },
                frozen.max_seq(),
            ) {
                if e.outcome_unknown() {
                    // The event may be durable; recovery drops the table if it is not.
                    warn!(id = table.id(), error = %e, "flush commit outcome unknown, keeping table");
                } else {
                    table.mark_obsolete();
                }
                return Err(e.into());
            }
            Some(table)
        };

        let table_id = table.as_ref().map(|t| t.id());
        inner.publish(|state| {
            if let Some(table) = table {
                state.version = Arc::new(state.version.with_flushed(table));
            }
            state.frozen.retain(|f| f.wal_seq() != wal_seq);
        });

        if let Err(e) = fs::remove_file(frozen.wal_path()) {
            warn!(wal_seq, error = %e, "failed to delete flushed WAL segment");
        }

        info!(wal_seq, id = ?table_id, entries = frozen.len(), "memtable flushed");
        inner.notify_flushed();
        Ok(true)
    }

    /// Freeze the active memtable (if it holds anything) and flush every
    /// frozen memtable synchronously.
    ///
    /// Returns the number of memtables flushed.
    pub fn flush_all(&self) -> Result<usize, EngineError> {
        let inner = &self.inner;
        inner.check_writable()?;
        {
            let guard = inner.writer.lock();
            inner.rotate(&guard)?;
        }

        let mut count = 0;
        while self.flush_oldest_frozen()? {
            count += 1;
        }
        Ok(count)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Run one compaction round chosen by the leveled policy.
    ///
    /// Returns `Ok(true)` if a compaction was installed, `Ok(false)` if the
    /// tree needed none.
    pub fn compact_once(&self) -> Result<bool, EngineError> {
        self.run_compaction(|policy, version| policy.pick(version))
    }

    /// Merge every live table into the bottom level, dropping everything
    /// no snapshot can observe.
    ///
    /// Returns `Ok(false)` if there are no tables.
    pub fn major_compact(&self) -> Result<bool, EngineError> {
        self.run_compaction(|policy, version| policy.pick_major(version))
    }

    fn run_compaction(
        &self,
        pick: impl FnOnce(&LeveledPolicy, &Version) -> Option<CompactionTask>,
    ) -> Result<bool, EngineError> {
        let inner = &self.inner;
        let _compaction = inner.compaction_lock.lock();
        let _idle = PhaseReset(&inner.phase);

        inner.phase.set(CompactionPhase::Selecting);
        let version = Arc::clone(&inner.current().version);
        let Some(task) = pick(&inner.policy, version.as_ref()) else {
            debug!(tables = version.table_count(), "compaction found nothing to do");
            return Ok(false);
        };
        drop(version);

        inner.phase.set(CompactionPhase::Merging);
        let output = compaction::merge(
            &task,
            &inner.manifest,
            &inner.sst_dir,
            &inner.merge_options,
            inner.oldest_snapshot(),
        )?;

        inner.phase.set(CompactionPhase::Installing);
        if let Err(e) = inner
            .manifest
            .apply_compaction(output.manifest_entries(), output.removed.clone())
        {
            if e.outcome_unknown() {
                // The event may be durable; recovery drops the outputs if it is not.
                warn!(error = %e, "compaction commit outcome unknown, keeping outputs");
            } else {
                output.discard();
            }
            return Err(e.into());
        }

        let added_ids: Vec<u64> = output.added.iter().map(|t| t.id()).collect();
        inner.publish(|state| {
            state.version = Arc::new(state.version.with_compaction(
                &output.removed,
                output.added.clone(),
                output.output_level,
            ));
        });
        for table in &task.inputs {
            table.mark_obsolete();
        }

        info!(
            level = output.output_level,
            removed = ?output.removed,
            added = ?added_ids,
            input_bytes = task.input_bytes(),
            "compaction installed"
        );
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Background work
    // --------------------------------------------------------------------------------------------

    /// Run `task` with retries and exponential backoff.
    ///
    /// After `background_retry_limit` failed retries the engine turns
    /// read-only. Returns the follow-up task, if any.
    pub fn run_background(&self, task: BackgroundTask) -> Option<BackgroundTask> {
        let config = &self.inner.config;
        let mut attempt: u32 = 0;

        loop {
            if self.is_read_only() {
                return None;
            }

            let result = match task {
                BackgroundTask::Flush => self.flush_oldest_frozen(),
                BackgroundTask::Compact => self.compact_until_idle().map(|rounds| rounds > 0),
            };

            match result {
                Ok(true) if task == BackgroundTask::Flush => return Some(BackgroundTask::Compact),
                Ok(_) => return None,
                Err(e) if attempt < config.background_retry_limit => {
                    let delay = config
                        .background_retry_backoff
                        .saturating_mul(1u32 << attempt.min(16));
                    attempt += 1;
                    warn!(?task, attempt, ?delay, error = %e, "background task failed, retrying");
                    thread::sleep(delay);
                }
                Err(e) => {
                    error!(?task, attempts = attempt + 1, error = %e, "background task failed");
                    self.inner.degrade();
                    return None;
                }
            }
        }
    }

    fn compact_until_idle(&self) -> Result<usize, EngineError> {
        let mut rounds = 0;
        while !self.is_read_only() && self.compact_once()? {
            rounds += 1;
        }
        if rounds > 0 {
            debug!(rounds, "background compaction settled");
        }
        Ok(rounds)
    }

    /// Sync the active WAL if its batched window has expired.
    pub fn sync_wal_if_due(&self) -> Result<(), EngineError> {
        Ok(self.inner.current().active.sync_wal_if_due()?)
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Sequence number of the last acknowledged write.
    pub fn last_seq(&self) -> u64 {
        self.inner.last_seq.load(Ordering::Acquire)
    }

    pub fn frozen_count(&self) -> usize {
        self.inner.current().frozen.len()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    pub fn compaction_phase(&self) -> CompactionPhase {
        self.inner.phase.get()
    }

    /// Manifest entries of the live tables, level 0 first.
    pub fn sstables(&self) -> Vec<ManifestSstEntry> {
        self.inner.current().version.entries()
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let state = inner.current();
        let levels = (0..state.version.max_levels())
            .map(|n| LevelStats {
                files: state.version.level(n).len(),
                bytes: state.version.level_bytes(n),
            })
            .collect();

        EngineStats {
            frozen_count: state.frozen.len(),
            active_memtable_size: state.active.approximate_size(),
            levels,
            compaction_phase: inner.phase.get(),
            last_seq: self.last_seq(),
            read_only: self.is_read_only(),
            live_snapshots: inner.snapshots.len(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Internals
// ------------------------------------------------------------------------------------------------

impl EngineInner {
    fn current(&self) -> Arc<LsmState> {
        Arc::clone(&self.state.read())
    }

    fn current_until(&self, deadline: Option<Instant>) -> Result<Arc<LsmState>, EngineError> {
        match deadline {
            Some(deadline) => self
                .state
                .try_read_until(deadline)
                .map(|state| Arc::clone(&state))
                .ok_or(EngineError::Timeout),
            None => Ok(self.current()),
        }
    }

    /// Copy-on-write update of the published state.
    fn publish(&self, update: impl FnOnce(&mut LsmState)) {
        let mut guard = self.state.write();
        let mut next = LsmState::clone(&guard);
        update(&mut next);
        *guard = Arc::new(next);
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }

    /// Remove `pending` from the commit queue. Returns `false` if a group
    /// already took it.
    fn withdraw(&self, pending: &Arc<PendingWrite>) -> bool {
        let mut queue = self.commit_queue.lock();
        match queue.iter().position(|queued| Arc::ptr_eq(queued, pending)) {
            Some(idx) => {
                queue.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Commit every queued write with one WAL append, publish the new last
    /// sequence number, and rotate the memtable if it is full. Returns
    /// whether a rotation happened.
    fn commit_group(&self, writer: &MutexGuard<'_, ()>) -> bool {
        let queued = mem::take(&mut *self.commit_queue.lock());
        let (group, writes): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .filter_map(|pending| pending.take_write().map(|write| (pending, write)))
            .unzip();
        if group.is_empty() {
            return false;
        }

        let state = self.current();
        let first_seq = self.last_seq.load(Ordering::Acquire) + 1;
        let mut last_seq = None;
        match state.active.write_batch(writes, first_seq) {
            Ok(outcomes) => {
                for (pending, outcome) in group.iter().zip(outcomes) {
                    match outcome {
                        Ok(seq) => {
                            last_seq = Some(seq);
                            pending.complete(Ok(()));
                        }
                        Err(e) => pending.complete(Err(e.into())),
                    }
                }
            }
            Err(e) => {
                let shared = e.to_string();
                let mut first = Some(EngineError::from(e));
                for pending in &group {
                    let err = first.take().unwrap_or_else(|| {
                        EngineError::Io(io::Error::other(format!("group commit failed: {shared}")))
                    });
                    pending.complete(Err(err));
                }
            }
        }

        let Some(seq) = last_seq else {
            return false;
        };
        self.last_seq.store(seq, Ordering::Release);
        trace!(first_seq, last_seq = seq, writes = group.len(), "group committed");

        if state.active.approximate_size() < self.config.write_buffer_size {
            return false;
        }
        drop(state);

        match self.rotate(writer) {
            Ok(rotated) => rotated,
            Err(e) => {
                // The writes themselves are durable; rotation is retried on the next group.
                warn!(seq, error = %e, "memtable rotation failed");
                false
            }
        }
    }

    fn lock_writer(&self, deadline: Option<Instant>) -> Result<MutexGuard<'_, ()>, EngineError> {
        match deadline {
            Some(deadline) => self
                .writer
                .try_lock_until(deadline)
                .ok_or(EngineError::Timeout),
            None => Ok(self.writer.lock()),
        }
    }

    /// Block while the frozen queue is full.
    fn wait_for_room(
        &self,
        guard: &mut MutexGuard<'_, ()>,
        deadline: Option<Instant>,
    ) -> Result<(), EngineError> {
        loop {
            self.check_writable()?;
            let frozen = self.current().frozen.len();
            if frozen < self.config.max_frozen_memtables {
                return Ok(());
            }

            debug!(frozen, "write stalled on pending flushes");
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::WriteStall);
                    }
                    self.flushed.wait_until(guard, deadline);
                }
                None => self.flushed.wait(guard),
            }
        }
    }

    fn notify_flushed(&self) {
        // Taking the writer lock orders this wakeup after any waiter's check.
        drop(self.writer.lock());
        self.flushed.notify_all();
    }

    fn degrade(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!(path = %self.data_dir.display(), "engine degraded to read-only");
        }
        self.notify_flushed();
    }

    /// Freeze the active memtable and open the next WAL generation.
    ///
    /// Requires the writer lock. Returns `Ok(false)` if the active memtable
    /// is empty. The new segment exists before the manifest names it, and
    /// nothing is written to it until the state is published.
    fn rotate(&self, _writer: &MutexGuard<'_, ()>) -> Result<bool, EngineError> {
        let active = Arc::clone(&self.current().active);
        if active.is_empty() {
            return Ok(false);
        }

        active.sync_wal()?;
        let next = active.next_generation()?;
        self.manifest
            .record_rotation(active.wal_seq(), next.wal_seq())?;

        let frozen_wal = active.wal_seq();
        let active_wal = next.wal_seq();
        let frozen = active.freeze();
        let mut pending = 0;
        self.publish(|state| {
            state.active = Arc::new(next);
            state.frozen.insert(0, frozen);
            pending = state.frozen.len();
        });

        info!(frozen_wal, active_wal, pending, "memtable rotated");
        Ok(true)
    }

    /// Write a frozen memtable into a new level-0 table.
    fn write_level0(&self, frozen: &FrozenMemtable) -> Result<Arc<SSTable>, EngineError> {
        let id = self.manifest.allocate_sst_id()?;
        let path = self.sst_dir.join(sst_file_name(id));
        let mut writer = SstWriter::create(
            &path,
            SstWriterOptions {
                block_size: self.config.block_size,
                bloom_bits_per_key: self.config.bloom_bits_per_key,
                rate_limiter: None,
            },
        )?;

        for (key, entry) in frozen.iter_for_flush() {
            if let Err(e) = writer.add(&Record::from_memtable(key, entry)) {
                writer.abort();
                return Err(e.into());
            }
        }
        let summary = writer.finish()?;
        debug!(
            id,
            bytes = summary.file_size,
            entries = summary.entry_count,
            "level-0 table written"
        );

        match SSTable::open(&summary.path, id) {
            Ok(table) => Ok(Arc::new(table)),
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&summary.path) {
                    warn!(id, error = %remove_err, "failed to remove unreadable level-0 table");
                }
                Err(e.into())
            }
        }
    }

    /// Lowest sequence number any reader may still read at.
    fn oldest_snapshot(&self) -> u64 {
        self.snapshots
            .horizon(|| self.last_seq.load(Ordering::Acquire))
    }
}

/// Returns the compaction phase to `Idle` however the cycle ends.
struct PhaseReset<'a>(&'a PhaseTracker);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.set(CompactionPhase::Idle);
    }
}

// ------------------------------------------------------------------------------------------------
// Startup cleanup
// ------------------------------------------------------------------------------------------------

fn remove_orphan_tables(sst_dir: &Path, live: &HashSet<u64>) -> Result<(), EngineError> {
    for entry in fs::read_dir(sst_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let orphan = match sstable::parse_sst_id(&path) {
            Some(id) => !live.contains(&id),
            None => path.extension().is_some_and(|ext| ext == "tmp"),
        };
        if orphan {
            remove_orphan(&path);
        }
    }
    Ok(())
}

fn remove_orphan_wals(wal_dir: &Path, live: &HashSet<u64>) -> Result<(), EngineError> {
    for entry in fs::read_dir(wal_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if wal::parse_wal_seq(&path).is_some_and(|seq| !live.contains(&seq)) {
            remove_orphan(&path);
        }
    }
    Ok(())
}

fn remove_orphan(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed orphan file"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphan file"),
    }
}

fn sync_dir(path: &Path) -> Result<(), EngineError> {
    fs::File::open(path)?.sync_all()?;
    Ok(())
}
