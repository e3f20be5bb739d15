//! # Compaction Module
//!
//! Background merging of SSTables into deeper levels.
//!
//! Every cycle moves through four phases, published through
//! [`PhaseTracker`] so callers can observe progress:
//!
//! ```text
//! Idle → Selecting → Merging → Installing → Idle
//! ```
//!
//! - **Selecting** — a [`CompactionStrategy`] inspects the current
//!   [`Version`] and returns a [`CompactionTask`] (or nothing to do).
//! - **Merging** — [`merge`] streams the input tables through a k-way
//!   [`MergeIterator`], discards versions no reader can observe, and writes
//!   the survivors into new tables of roughly `target_file_size`.
//! - **Installing** — the engine records one manifest `Compaction` event and
//!   swaps in the new `Version`; replaced tables are then marked obsolete
//!   and deleted once the last reader drops them.
//!
//! Selection and merging never touch shared state, so a task that fails
//! before installing leaves the tree exactly as it was; the orphaned output
//! files are removed here or, after a crash, by the startup scan.

pub mod leveled;
pub mod throttle;

#[cfg(test)]
mod tests;

use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::utils::{MergeIterator, Record, RecordStream};
use crate::engine::version::Version;
use crate::manifest::{Manifest, ManifestError, ManifestSstEntry};
use crate::memtable::current_timestamp;
use crate::sstable::{SSTable, SSTableError, SstWriter, SstWriterOptions, sst_file_name};
use throttle::RateLimiter;

pub use leveled::LeveledPolicy;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Phase tracking
// ------------------------------------------------------------------------------------------------

/// Where the current compaction cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompactionPhase {
    Idle = 0,
    Selecting = 1,
    Merging = 2,
    Installing = 3,
}

/// Lock-free cell holding the current [`CompactionPhase`].
#[derive(Debug)]
pub struct PhaseTracker(AtomicU8);

impl PhaseTracker {
    pub fn new() -> Self {
        Self(AtomicU8::new(CompactionPhase::Idle as u8))
    }

    pub fn get(&self) -> CompactionPhase {
        match self.0.load(Ordering::Acquire) {
            1 => CompactionPhase::Selecting,
            2 => CompactionPhase::Merging,
            3 => CompactionPhase::Installing,
            _ => CompactionPhase::Idle,
        }
    }

    pub fn set(&self, phase: CompactionPhase) {
        let prev = self.0.swap(phase as u8, Ordering::AcqRel);
        if prev != phase as u8 {
            debug!(?phase, "compaction phase");
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Strategy seam
// ------------------------------------------------------------------------------------------------

/// A unit of compaction work chosen by a strategy.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Tables to merge, from every participating level.
    pub inputs: Vec<Arc<SSTable>>,
    pub output_level: usize,
    /// No level below `output_level` holds data in the inputs' key range,
    /// so tombstones that reach the output shadow nothing else.
    pub bottommost: bool,
}

impl CompactionTask {
    pub fn input_ids(&self) -> Vec<u64> {
        self.inputs.iter().map(|t| t.id()).collect()
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|t| t.file_size()).sum()
    }
}

/// Chooses what to compact next.
///
/// Implementations are pure functions of the version, so calling `pick`
/// again after a failed cycle selects the same work.
pub trait CompactionStrategy: Send + Sync {
    /// Regular background selection; `None` when the tree is in shape.
    fn pick(&self, version: &Version) -> Option<CompactionTask>;

    /// Every live table merged into the bottom level.
    fn pick_major(&self, version: &Version) -> Option<CompactionTask>;
}

/// Whether any level below `output_level` overlaps `[start, end]`.
pub(crate) fn is_bottommost(version: &Version, output_level: usize, start: &[u8], end: &[u8]) -> bool {
    (output_level + 1..version.max_levels()).all(|n| version.overlapping(n, start, end).is_empty())
}

// ------------------------------------------------------------------------------------------------
// Merging
// ------------------------------------------------------------------------------------------------

/// Knobs that shape merge output.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub target_file_size: u64,
    pub block_size: usize,
    pub bloom_bits_per_key: usize,
    pub tombstone_retention: Duration,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl MergeOptions {
    fn writer_options(&self) -> SstWriterOptions {
        SstWriterOptions {
            block_size: self.block_size,
            bloom_bits_per_key: self.bloom_bits_per_key,
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

/// New tables produced by a merge, ready to install.
#[derive(Debug)]
pub struct MergeOutput {
    pub added: Vec<Arc<SSTable>>,
    pub removed: Vec<u64>,
    pub output_level: usize,
    pub dropped_versions: u64,
    pub dropped_tombstones: u64,
}

impl MergeOutput {
    pub fn manifest_entries(&self) -> Vec<ManifestSstEntry> {
        self.added
            .iter()
            .map(|t| ManifestSstEntry {
                id: t.id(),
                level: self.output_level as u32,
            })
            .collect()
    }

    /// Remove the output files; used when installation fails.
    pub fn discard(self) {
        for table in self.added {
            table.mark_obsolete();
        }
    }
}

/// Decides, record by record, what survives a merge.
///
/// `oldest_snapshot` is the smallest sequence number any reader may still
/// read at. A version is hidden from every reader once a newer version of
/// the same key is itself visible at `oldest_snapshot`.
struct GarbageFilter {
    oldest_snapshot: u64,
    bottommost: bool,
    retention_cutoff: u64,
    current_key: Option<Vec<u8>>,
    /// Sequence number of the previous (newer) version of `current_key`.
    newer_seq: Option<u64>,
    dropped_versions: u64,
    dropped_tombstones: u64,
}

impl GarbageFilter {
    fn new(oldest_snapshot: u64, bottommost: bool, retention: Duration) -> Self {
        let retention = u64::try_from(retention.as_nanos()).unwrap_or(u64::MAX);
        Self {
            oldest_snapshot,
            bottommost,
            retention_cutoff: current_timestamp().saturating_sub(retention),
            current_key: None,
            newer_seq: None,
            dropped_versions: 0,
            dropped_tombstones: 0,
        }
    }

    fn keep(&mut self, record: &Record) -> bool {
        if self.current_key.as_deref() != Some(record.key()) {
            self.current_key = Some(record.key().to_vec());
            self.newer_seq = None;
        }
        let newer_seq = self.newer_seq.replace(record.seq());

        if newer_seq.is_some_and(|seq| seq <= self.oldest_snapshot) {
            self.dropped_versions += 1;
            return false;
        }

        if record.is_delete()
            && self.bottommost
            && record.seq() <= self.oldest_snapshot
            && record.timestamp() <= self.retention_cutoff
        {
            self.dropped_tombstones += 1;
            return false;
        }
        true
    }
}

/// Merge the task's inputs into new tables under `sst_dir`.
///
/// Output files are cut at `target_file_size`, only between keys. On error,
/// every output written so far is removed.
pub fn merge(
    task: &CompactionTask,
    manifest: &Manifest,
    sst_dir: &Path,
    options: &MergeOptions,
    oldest_snapshot: u64,
) -> Result<MergeOutput, CompactionError> {
    let mut finished: Vec<Arc<SSTable>> = Vec::new();

    match merge_into(task, manifest, sst_dir, options, oldest_snapshot, &mut finished) {
        Ok((dropped_versions, dropped_tombstones)) => {
            info!(
                inputs = task.inputs.len(),
                outputs = finished.len(),
                output_level = task.output_level,
                dropped_versions,
                dropped_tombstones,
                "compaction merge finished"
            );
            Ok(MergeOutput {
                added: finished,
                removed: task.input_ids(),
                output_level: task.output_level,
                dropped_versions,
                dropped_tombstones,
            })
        }
        Err(e) => {
            for table in finished {
                table.mark_obsolete();
            }
            Err(e)
        }
    }
}

fn merge_into(
    task: &CompactionTask,
    manifest: &Manifest,
    sst_dir: &Path,
    options: &MergeOptions,
    oldest_snapshot: u64,
    finished: &mut Vec<Arc<SSTable>>,
) -> Result<(u64, u64), CompactionError> {
    let sources: Vec<RecordStream<'_>> = task
        .inputs
        .iter()
        .map(|t| Box::new(t.iter()) as RecordStream<'_>)
        .collect();
    let merged = MergeIterator::new(sources);
    let mut filter = GarbageFilter::new(
        oldest_snapshot,
        task.bottommost,
        options.tombstone_retention,
    );

    let mut writer: Option<(u64, SstWriter)> = None;
    let mut last_key: Option<Vec<u8>> = None;

    for item in merged {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                if let Some((_, w)) = writer.take() {
                    w.abort();
                }
                return Err(e.into());
            }
        };
        if !filter.keep(&record) {
            continue;
        }

        let key_changed = last_key.as_deref() != Some(record.key());
        let full = writer
            .as_ref()
            .is_some_and(|(_, w)| w.estimated_size() >= options.target_file_size);
        if key_changed && full {
            if let Some((id, w)) = writer.take() {
                finished.push(finish_output(id, w, sst_dir)?);
            }
        }

        if writer.is_none() {
            let id = manifest.allocate_sst_id()?;
            let path = sst_dir.join(sst_file_name(id));
            writer = Some((id, SstWriter::create(&path, options.writer_options())?));
        }
        let added = writer.as_mut().map_or(Ok(()), |(_, w)| w.add(&record));
        if let Err(e) = added {
            if let Some((_, w)) = writer.take() {
                w.abort();
            }
            return Err(e.into());
        }
        if key_changed {
            last_key = Some(record.key().to_vec());
        }
    }

    if let Some((id, w)) = writer.take() {
        finished.push(finish_output(id, w, sst_dir)?);
    }

    Ok((filter.dropped_versions, filter.dropped_tombstones))
}

fn finish_output(id: u64, writer: SstWriter, sst_dir: &Path) -> Result<Arc<SSTable>, CompactionError> {
    let summary = writer.finish()?;
    debug!(id, bytes = summary.file_size, entries = summary.entry_count, "compaction output written");
    match SSTable::open(&summary.path, id) {
        Ok(table) => Ok(Arc::new(table)),
        Err(e) => {
            let path = sst_dir.join(sst_file_name(id));
            if let Err(remove_err) = fs::remove_file(&path) {
                warn!(id, error = %remove_err, "failed to remove unreadable compaction output");
            }
            Err(e.into())
        }
    }
}
