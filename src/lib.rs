//! # BurstDB
//!
//! An embeddable, persistent key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed to absorb
//! write storms (many small concurrent writes in a short window) while
//! keeping point reads fast.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use burstdb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Write
//! db.put(b"patient-42:q1", b"5").unwrap();
//! db.put(b"patient-42:q1", b"7").unwrap();
//!
//! // Read
//! assert_eq!(db.get(b"patient-42:q1").unwrap(), Some(b"7".to_vec()));
//!
//! // Delete
//! db.delete(b"patient-42:q1").unwrap();
//! assert_eq!(db.get(b"patient-42:q1").unwrap(), None);
//!
//! // Scan
//! db.put(b"a", b"1").unwrap();
//! db.put(b"b", b"2").unwrap();
//! let results = db.scan(b"a", b"c").unwrap();
//! assert_eq!(results.len(), 2);
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging** — every mutation is persisted before acknowledgement.
//! - **Leveled compaction** — background threads push data down the levels.
//! - **Backpressure** — writers stall, bounded by a deadline, while flushes catch up.
//! - **Snapshots** — repeatable point reads and scans at a pinned sequence number.
//! - **Bloom filters** — fast negative lookups on SSTables.
//! - **CRC32 integrity** — all on-disk blocks are checksummed.
//! - **Crash recovery** — automatic recovery from the manifest and WAL on restart.

#![allow(dead_code)]

pub(crate) mod compaction;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod manifest;
pub(crate) mod memtable;
pub(crate) mod sstable;
pub(crate) mod wal;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use engine::{BackgroundTask, Engine, EngineConfig};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use compaction::CompactionPhase;
pub use engine::{EngineError, EngineStats, KeyValue, LevelStats, Snapshot};
pub use wal::SyncPolicy;

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 65_535;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound for [`DbConfig::bloom_bits_per_key`].
pub const MAX_BLOOM_BITS_PER_KEY: usize = 64;

/// Room for one maximal key/value pair plus its WAL record framing.
const MAX_RECORD_SIZE: u32 = (MAX_KEY_SIZE + MAX_VALUE_SIZE + 64) as u32;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have sensible defaults via [`DbConfig::default()`].
/// The configuration is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use burstdb::{DbConfig, SyncPolicy};
/// use std::time::Duration;
///
/// // Use defaults (4 MiB buffer, fsync on every write, 2 background threads)
/// let config = DbConfig::default();
///
/// // Or customize
/// let config = DbConfig {
///     write_buffer_size: 16 * 1024 * 1024,
///     sync_policy: SyncPolicy::Batched {
///         max_writes: 128,
///         max_delay: Duration::from_millis(5),
///     },
///     thread_pool_size: 4,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Size of the in-memory write buffer in bytes.
    ///
    /// When the buffer is full it is frozen and flushed to a level-0
    /// SSTable in the background.
    ///
    /// Default: 4 MiB. Must be ≥ 1024.
    pub write_buffer_size: usize,

    /// When WAL appends are forced to stable storage.
    ///
    /// Default: [`SyncPolicy::EveryWrite`]. A batched policy needs
    /// `max_writes ≥ 1` and a non-zero `max_delay`.
    pub sync_policy: SyncPolicy,

    /// Number of level-0 tables that triggers a level-0 compaction.
    ///
    /// Default: 4. Must be ≥ 1.
    pub level0_compaction_trigger: usize,

    /// Byte budget of level 1.
    ///
    /// Default: 64 MiB. Must be > 0.
    pub level_base_size: u64,

    /// Each level below 1 may hold this many times the bytes of the one above.
    ///
    /// Default: 10. Must be ≥ 2.
    pub level_size_multiplier: u64,

    /// Number of levels, level 0 included.
    ///
    /// Default: 7. Must be in `2..=16`.
    pub max_levels: usize,

    /// Compaction output is split into files of roughly this size.
    ///
    /// Default: 8 MiB. Must be > 0.
    pub target_file_size: u64,

    /// Target size of an SSTable data block.
    ///
    /// Default: 4 KiB. Must be ≥ 64.
    pub block_size: usize,

    /// Bloom filter bits per key; `0` disables the filter.
    ///
    /// Default: 10.
    pub bloom_bits_per_key: usize,

    /// Writers stall once this many memtables are waiting for flush.
    ///
    /// Default: 4. Must be ≥ 1.
    pub max_frozen_memtables: usize,

    /// Minimum age before a tombstone may be dropped at the bottom level.
    ///
    /// Default: 1 hour.
    pub tombstone_retention: Duration,

    /// Compaction write budget in bytes per second; `None` is unthrottled.
    ///
    /// Default: `None`. Must be > 0 when set.
    pub compaction_rate_limit: Option<u64>,

    /// How many times a failed flush or compaction is retried before the
    /// database turns read-only.
    ///
    /// Default: 3.
    pub background_retry_limit: u32,

    /// Delay before the first retry; doubled on each further attempt.
    ///
    /// Default: 100 ms.
    pub background_retry_backoff: Duration,

    /// Number of background worker threads for flushing and compaction.
    ///
    /// Default: 2. Must be ≥ 1.
    pub thread_pool_size: usize,

    /// Default deadline applied to [`Db::put`], [`Db::delete`] and
    /// [`Db::get`]; `None` waits indefinitely.
    ///
    /// Default: `None`. Must be non-zero when set.
    pub operation_timeout: Option<Duration>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            sync_policy: SyncPolicy::EveryWrite,
            level0_compaction_trigger: 4,
            level_base_size: 64 * 1024 * 1024,
            level_size_multiplier: 10,
            max_levels: 7,
            target_file_size: 8 * 1024 * 1024,
            block_size: 4096,
            bloom_bits_per_key: 10,
            max_frozen_memtables: 4,
            tombstone_retention: Duration::from_secs(3600),
            compaction_rate_limit: None,
            background_retry_limit: 3,
            background_retry_backoff: Duration::from_millis(100),
            thread_pool_size: 2,
            operation_timeout: None,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.write_buffer_size < 1024 {
            return Err(DbError::InvalidConfig(
                "write_buffer_size must be >= 1024".into(),
            ));
        }
        if let SyncPolicy::Batched {
            max_writes,
            max_delay,
        } = self.sync_policy
        {
            if max_writes == 0 || max_delay.is_zero() {
                return Err(DbError::InvalidConfig(
                    "batched sync_policy needs max_writes >= 1 and a non-zero max_delay".into(),
                ));
            }
        }
        if self.level0_compaction_trigger < 1 {
            return Err(DbError::InvalidConfig(
                "level0_compaction_trigger must be >= 1".into(),
            ));
        }
        if self.level_base_size == 0 {
            return Err(DbError::InvalidConfig(
                "level_base_size must be > 0".into(),
            ));
        }
        if self.level_size_multiplier < 2 {
            return Err(DbError::InvalidConfig(
                "level_size_multiplier must be >= 2".into(),
            ));
        }
        if !(2..=16).contains(&self.max_levels) {
            return Err(DbError::InvalidConfig(
                "max_levels must be in 2..=16".into(),
            ));
        }
        if self.target_file_size == 0 {
            return Err(DbError::InvalidConfig(
                "target_file_size must be > 0".into(),
            ));
        }
        if self.block_size < 64 {
            return Err(DbError::InvalidConfig("block_size must be >= 64".into()));
        }
        if self.bloom_bits_per_key > MAX_BLOOM_BITS_PER_KEY {
            return Err(DbError::InvalidConfig(format!(
                "bloom_bits_per_key must be <= {MAX_BLOOM_BITS_PER_KEY}"
            )));
        }
        if self.max_frozen_memtables < 1 {
            return Err(DbError::InvalidConfig(
                "max_frozen_memtables must be >= 1".into(),
            ));
        }
        if self.compaction_rate_limit == Some(0) {
            return Err(DbError::InvalidConfig(
                "compaction_rate_limit must be > 0 when set".into(),
            ));
        }
        if self.thread_pool_size < 1 {
            return Err(DbError::InvalidConfig(
                "thread_pool_size must be >= 1".into(),
            ));
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DbError::InvalidConfig(
                "operation_timeout must be non-zero when set".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            write_buffer_size: self.write_buffer_size,
            sync_policy: self.sync_policy,
            max_record_size: MAX_RECORD_SIZE,
            max_frozen_memtables: self.max_frozen_memtables,
            max_levels: self.max_levels,
            level0_compaction_trigger: self.level0_compaction_trigger,
            level_base_size: self.level_base_size,
            level_size_multiplier: self.level_size_multiplier,
            target_file_size: self.target_file_size,
            block_size: self.block_size,
            bloom_bits_per_key: self.bloom_bits_per_key,
            tombstone_retention: self.tombstone_retention,
            compaction_rate_limit: self.compaction_rate_limit,
            background_retry_limit: self.background_retry_limit,
            background_retry_backoff: self.background_retry_backoff,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A background thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl DbError {
    /// `true` if a deadline expired, whether on a lock or on backpressure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DbError::Engine(EngineError::Timeout | EngineError::WriteStall)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Holds the task sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: Sender<BackgroundTask>,
    workers: Vec<thread::JoinHandle<()>>,
    wal_syncer: Option<WalSyncer>,
}

impl BackgroundPool {
    fn start(engine: &Engine, config: &DbConfig) -> Result<Self, DbError> {
        let (sender, receiver) = channel::unbounded::<BackgroundTask>();

        let mut pool = Self {
            sender,
            workers: Vec::with_capacity(config.thread_pool_size),
            wal_syncer: None,
        };
        for id in 0..config.thread_pool_size {
            let rx = receiver.clone();
            let engine = engine.clone();
            let spawned = thread::Builder::new()
                .name(format!("burstdb-bg-{id}"))
                .spawn(move || worker_loop(engine, rx));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }
        // Workers hold their own receiver clones; drop ours.
        drop(receiver);

        if let SyncPolicy::Batched { max_delay, .. } = config.sync_policy {
            match WalSyncer::start(engine.clone(), max_delay) {
                Ok(syncer) => pool.wal_syncer = Some(syncer),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    fn submit(&self, task: BackgroundTask) {
        if self.sender.send(task).is_err() {
            warn!(?task, "background pool is gone, task dropped");
        }
    }

    /// Stops the WAL syncer, drains the task queue and joins all workers.
    fn shutdown(self) {
        if let Some(syncer) = self.wal_syncer {
            syncer.stop();
        }
        // Drop sender → workers drain remaining tasks then exit.
        drop(self.sender);
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("background worker panicked");
            }
        }
    }
}

/// Runs each received task and whatever follow-up it asks for.
fn worker_loop(engine: Engine, rx: Receiver<BackgroundTask>) {
    while let Ok(task) = rx.recv() {
        let mut next = Some(task);
        while let Some(task) = next {
            debug!(?task, "background task started");
            next = engine.run_background(task);
        }
    }
}

/// Periodically syncs the active WAL so a batched sync window is bounded
/// by `max_delay` even when writes stop.
struct WalSyncer {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl WalSyncer {
    fn start(engine: Engine, period: Duration) -> Result<Self, DbError> {
        let (stop, stopped) = channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("burstdb-wal-sync".into())
            .spawn(move || {
                let ticker = channel::tick(period);
                loop {
                    crossbeam::select! {
                        recv(stopped) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = engine.sync_wal_if_due() {
                                warn!(error = %e, "periodic WAL sync failed");
                            }
                        }
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        // Dropping the sender disconnects the channel and wakes the select.
        drop(self.stop);
        if self.handle.join().is_err() {
            warn!("WAL sync thread panicked");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// Provides a high-level, thread-safe API for reading and writing
/// key-value pairs with automatic background flushing and compaction.
///
/// # Thread safety
///
/// `Db` is `Send + Sync`; it can be shared across threads via
/// `Arc<Db>`.
///
/// # Background work
///
/// When the write buffer fills, the active memtable is frozen and a
/// [`Flush`](BackgroundTask::Flush) task is queued. A worker writes the
/// frozen memtable to level 0, then runs leveled compaction rounds until
/// every level is within budget. Failed tasks are retried with exponential
/// backoff; if they keep failing the database turns read-only.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor will attempt cleanup, but
/// errors are only logged.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
    operation_timeout: Option<Duration>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("engine", &self.engine)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database at the given directory.
    ///
    /// On a fresh directory the required sub-directories are created
    /// automatically. On an existing directory, the manifest and WALs
    /// are replayed to recover the last durable state, and flushes are
    /// queued for memtables that were frozen but never flushed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range, or [`DbError::Io`] if a background thread cannot
    /// be started.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        let engine = Engine::open(&path, config.to_engine_config())?;
        let pool = BackgroundPool::start(&engine, &config)?;

        let pending = engine.frozen_count();
        for _ in 0..pending {
            pool.submit(BackgroundTask::Flush);
        }
        if pending == 0 {
            pool.submit(BackgroundTask::Compact);
        }

        info!(
            path = %path.as_ref().display(),
            pool_size = config.thread_pool_size,
            pending_flushes = pending,
            "database opened"
        );

        Ok(Self {
            engine,
            bg: Mutex::new(Some(pool)),
            closed: AtomicBool::new(false),
            operation_timeout: config.operation_timeout,
        })
    }

    /// Gracefully shuts down the database.
    ///
    /// Waits for all in-flight background tasks to complete, flushes
    /// remaining frozen memtables, syncs the WAL, checkpoints the manifest,
    /// and fsyncs all directories.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }

        self.shutdown_pool();
        self.engine.close()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// The write is persisted to the WAL before being applied in memory.
    /// If the write buffer is full, the active memtable is frozen and a
    /// background flush is scheduled automatically. An empty value is a
    /// value, not a deletion.
    ///
    /// Uses [`DbConfig::operation_timeout`] as the deadline, if set.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty or too long,
    /// or if `value` exceeds [`MAX_VALUE_SIZE`].
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.put_with_deadline(key, value, self.default_deadline())
    }

    /// [`Db::put`] with an explicit deadline.
    ///
    /// If the deadline passes while waiting for the writer lock or on
    /// backpressure, nothing is written and the call fails with
    /// [`EngineError::Timeout`] or [`EngineError::WriteStall`].
    pub fn put_with_deadline(
        &self,
        key: &[u8],
        value: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(DbError::InvalidArgument(format!(
                "value of {} bytes exceeds the {MAX_VALUE_SIZE} byte limit",
                value.len()
            )));
        }

        let frozen = self.engine.put(key.to_vec(), value.to_vec(), deadline)?;
        if frozen {
            self.schedule(BackgroundTask::Flush);
        }
        Ok(())
    }

    /// Deletes a key by inserting a tombstone.
    ///
    /// Subsequent reads return `None` until a new value is written.
    /// Deleting a key that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty or too long.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.delete_with_deadline(key, self.default_deadline())
    }

    /// [`Db::delete`] with an explicit deadline.
    pub fn delete_with_deadline(&self, key: &[u8], deadline: Option<Instant>) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        let frozen = self.engine.delete(key.to_vec(), deadline)?;
        if frozen {
            self.schedule(BackgroundTask::Flush);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value associated with a key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has been deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty or too long.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_with_deadline(key, self.default_deadline())
    }

    /// [`Db::get`] with an explicit deadline.
    pub fn get_with_deadline(
        &self,
        key: &[u8],
        deadline: Option<Instant>,
    ) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;
        Ok(self.engine.get(key, deadline)?)
    }

    /// Scans all live key-value pairs in the half-open range `[start, end)`.
    ///
    /// Returns pairs sorted by key in ascending order. Deleted keys
    /// are excluded. An empty or inverted range returns an empty `Vec`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `start` or `end` is empty.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<KeyValue>, DbError> {
        self.scan_until(start, end, u64::MAX)
    }

    /// Pins the current state for repeatable reads.
    ///
    /// While the returned handle is alive, compaction keeps every version
    /// it can observe. Drop it to release them.
    pub fn snapshot(&self) -> Result<Snapshot, DbError> {
        self.check_open()?;
        Ok(self.engine.snapshot())
    }

    /// Reads `key` as of `snapshot`.
    pub fn get_at(&self, snapshot: &Snapshot, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;
        Ok(self.engine.get_at(key, snapshot.seq(), self.default_deadline())?)
    }

    /// Scans `[start, end)` as of `snapshot`.
    pub fn scan_at(
        &self,
        snapshot: &Snapshot,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<KeyValue>, DbError> {
        self.scan_until(start, end, snapshot.seq())
    }

    fn scan_until(&self, start: &[u8], end: &[u8], read_seq: u64) -> Result<Vec<KeyValue>, DbError> {
        self.check_open()?;

        if start.is_empty() || end.is_empty() {
            return Err(DbError::InvalidArgument(
                "start and end keys must not be empty".into(),
            ));
        }

        Ok(self
            .engine
            .scan(start, end, read_seq, self.default_deadline())?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Freezes the write buffer and flushes every pending memtable to
    /// level 0. Blocks until done, then queues a compaction pass.
    ///
    /// Returns the number of memtables flushed.
    pub fn flush(&self) -> Result<usize, DbError> {
        self.check_open()?;
        let flushed = self.engine.flush_all()?;
        if flushed > 0 {
            self.schedule(BackgroundTask::Compact);
        }
        Ok(flushed)
    }

    /// Runs a full **major compaction**, merging every SSTable into the
    /// bottom level.
    ///
    /// This is a **blocking** operation. Shadowed versions and tombstones
    /// past their retention are dropped, except what a live snapshot can
    /// still observe.
    ///
    /// Returns `true` if compaction was performed, `false` if there
    /// were no SSTables.
    pub fn major_compact(&self) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.engine.major_compact()?)
    }

    /// Point-in-time statistics: memtables, files and bytes per level,
    /// compaction phase, last sequence number, read-only flag.
    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn default_deadline(&self) -> Option<Instant> {
        self.operation_timeout.map(|t| Instant::now() + t)
    }

    /// Queues background work.
    fn schedule(&self, task: BackgroundTask) {
        trace!(?task, "scheduling background task");
        if let Some(pool) = self.bg.lock().as_ref() {
            pool.submit(task);
        }
    }

    /// Drains the background task queue and joins all worker threads.
    fn shutdown_pool(&self) {
        let pool = self.bg.lock().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_pool();
            if let Err(e) = self.engine.close() {
                warn!(error = %e, "close on drop failed");
            }
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(DbError::InvalidArgument(format!(
            "key of {} bytes exceeds the {MAX_KEY_SIZE} byte limit",
            key.len()
        )));
    }
    Ok(())
}
