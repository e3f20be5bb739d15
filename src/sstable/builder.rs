//! SSTable writer: streams sorted records into a complete SSTable file.
//!
//! [`SstWriter`] is incremental: records are appended one at a time with
//! [`SstWriter::add`], which lets compaction cut an output file as soon as
//! [`SstWriter::estimated_size`] crosses the target size. Flushes feed the
//! whole frozen memtable through a single writer.
//!
//! # Input Requirements
//!
//! Records must arrive in `(key ASC, seq DESC)` order. Out-of-order input is
//! rejected with [`SSTableError::Internal`].
//!
//! # Output Guarantees
//!
//! - Every data block carries a CRC32 of its payload.
//! - All versions of one key land in the same data block.
//! - The bloom filter covers every distinct key, tombstones included.
//! - Properties capture min/max keys, sequence numbers, timestamps and counts.
//!
//! # Atomicity
//!
//! 1. Write everything to `path.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `path.tmp` → `path` and sync the directory.
//!
//! A crash cannot leave a partially written table under its final name.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    mem,
    path::{Path, PathBuf},
    sync::Arc,
};

use bloomfilter::Bloom;
use tracing::{debug, warn};

use crate::compaction::throttle::RateLimiter;
use crate::encoding::{self, Encode};
use crate::engine::utils::Record;
use crate::memtable::current_timestamp;

use super::{
    BlockEntry, BlockHandle, META_BLOOM, META_PROPERTIES, MetaIndexEntry,
    SST_BLOCK_CHECKSUM_SIZE, SST_BLOCK_LEN_SIZE, SST_FOOTER_SIZE, SST_HDR_MAGIC, SST_HDR_VERSION,
    SSTableError, SSTableFooter, SSTableIndexEntry, SSTablePropertiesBlock,
};

// ------------------------------------------------------------------------------------------------
// Options and summary
// ------------------------------------------------------------------------------------------------

/// Tuning knobs for a single table.
#[derive(Debug, Clone)]
pub struct SstWriterOptions {
    /// Target uncompressed size of a data block.
    pub block_size: usize,
    /// Bloom filter bits per distinct key; `0` disables the filter.
    pub bloom_bits_per_key: usize,
    /// Optional throttle applied to every block written.
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl Default for SstWriterOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            bloom_bits_per_key: 10,
            rate_limiter: None,
        }
    }
}

/// Description of a finished table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub max_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// BuildStats — accumulates metadata during construction
// ------------------------------------------------------------------------------------------------

struct BuildStats {
    entry_count: u64,
    tombstone_count: u64,
    min_seq: u64,
    max_seq: u64,
    min_timestamp: u64,
    max_timestamp: u64,
    min_key: Option<Vec<u8>>,
}

impl BuildStats {
    fn new() -> Self {
        Self {
            entry_count: 0,
            tombstone_count: 0,
            min_seq: u64::MAX,
            max_seq: 0,
            min_timestamp: u64::MAX,
            max_timestamp: 0,
            min_key: None,
        }
    }

    fn track(&mut self, record: &Record) {
        self.entry_count += 1;
        if record.is_delete() {
            self.tombstone_count += 1;
        }
        self.min_seq = self.min_seq.min(record.seq());
        self.max_seq = self.max_seq.max(record.seq());
        self.min_timestamp = self.min_timestamp.min(record.timestamp());
        self.max_timestamp = self.max_timestamp.max(record.timestamp());
        if self.min_key.is_none() {
            self.min_key = Some(record.key().to_vec());
        }
    }

    fn into_properties(self, max_key: Vec<u8>, data_block_count: u64) -> SSTablePropertiesBlock {
        SSTablePropertiesBlock {
            creation_timestamp: current_timestamp(),
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            data_block_count,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            min_key: self.min_key.unwrap_or_default(),
            max_key,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SstWriter
// ------------------------------------------------------------------------------------------------

/// Builds one SSTable file on disk.
///
/// # Example
///
/// ```rust,ignore
/// let mut writer = SstWriter::create(&path, SstWriterOptions::default())?;
/// for record in sorted_records {
///     writer.add(&record)?;
/// }
/// let summary = writer.finish()?;
/// ```
pub struct SstWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    options: SstWriterOptions,

    current_block: Vec<u8>,
    index_entries: Vec<SSTableIndexEntry>,
    distinct_keys: Vec<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    last_seq: u64,
    stats: BuildStats,
}

impl SstWriter {
    /// Create `path.tmp` and write the header.
    pub fn create(path: impl AsRef<Path>, options: SstWriterOptions) -> Result<Self, SSTableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut writer = Self {
            final_path,
            tmp_path,
            writer: BufWriter::new(file),
            offset: 0,
            options,
            current_block: Vec::new(),
            index_entries: Vec::new(),
            distinct_keys: Vec::new(),
            last_key: None,
            last_seq: 0,
            stats: BuildStats::new(),
        };
        writer.write_header()?;
        Ok(writer)
    }

    /// Append one record. Records must be in `(key ASC, seq DESC)` order.
    pub fn add(&mut self, record: &Record) -> Result<(), SSTableError> {
        let key = record.key();
        let new_key = match &self.last_key {
            None => true,
            Some(last) if last.as_slice() < key => true,
            Some(last) if last.as_slice() == key && record.seq() < self.last_seq => false,
            Some(_) => {
                return Err(SSTableError::Internal(format!(
                    "record out of order at seq {}",
                    record.seq()
                )));
            }
        };

        // A block is only cut between keys.
        if new_key && self.current_block.len() >= self.options.block_size {
            self.flush_data_block()?;
        }

        if new_key {
            self.distinct_keys.push(key.to_vec());
            self.last_key = Some(key.to_vec());
        }
        self.last_seq = record.seq();
        self.stats.track(record);

        BlockEntry::encode_cell(
            key,
            record.value(),
            record.seq(),
            record.timestamp(),
            &mut self.current_block,
        )?;
        Ok(())
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.current_block.len() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.stats.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.stats.entry_count == 0
    }

    /// Write the trailing blocks and footer, sync, and rename into place.
    pub fn finish(mut self) -> Result<SstSummary, SSTableError> {
        let Some(max_key) = self.last_key.clone() else {
            self.discard();
            return Err(SSTableError::Internal(
                "cannot build an SSTable with no records".into(),
            ));
        };

        match self.write_trailer(max_key) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    /// Drop the partially written file.
    pub fn abort(self) {
        self.discard();
    }

    fn write_trailer(&mut self, max_key: Vec<u8>) -> Result<SstSummary, SSTableError> {
        if !self.current_block.is_empty() {
            self.flush_data_block()?;
        }
        let data_block_count = self.index_entries.len() as u64;

        // Bloom filter block
        let bloom_handle = if self.options.bloom_bits_per_key > 0 {
            let items = self.distinct_keys.len();
            let bitmap_bytes = items
                .checked_mul(self.options.bloom_bits_per_key)
                .ok_or_else(|| SSTableError::Internal("bloom filter size overflows".into()))?
                .div_ceil(8)
                .max(8);
            let mut bloom: Bloom<[u8]> = Bloom::new(bitmap_bytes, items)
                .map_err(|e| SSTableError::Internal(format!("bloom filter: {e}")))?;
            for key in &self.distinct_keys {
                bloom.set(key.as_slice());
            }
            let bytes = bloom.as_slice().to_vec();
            Some(self.write_checksummed_block(&bytes)?)
        } else {
            None
        };
        self.distinct_keys = Vec::new();

        // Properties block
        let stats = mem::replace(&mut self.stats, BuildStats::new());
        let properties = stats.into_properties(max_key, data_block_count);
        let props_handle = self.write_checksummed_block(&encoding::encode_to_vec(&properties)?)?;

        // Metaindex block
        let mut meta_entries = Vec::with_capacity(2);
        if let Some(handle) = bloom_handle {
            meta_entries.push(MetaIndexEntry {
                name: META_BLOOM.to_string(),
                handle,
            });
        }
        meta_entries.push(MetaIndexEntry {
            name: META_PROPERTIES.to_string(),
            handle: props_handle,
        });
        let mut meta_bytes = Vec::new();
        encoding::encode_vec(&meta_entries, &mut meta_bytes)?;
        let metaindex = self.write_checksummed_block(&meta_bytes)?;

        // Index block
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index_entries, &mut index_bytes)?;
        let index = self.write_checksummed_block(&index_bytes)?;

        // Footer
        let mut footer = SSTableFooter {
            metaindex,
            index,
            total_file_size: self.offset + SST_FOOTER_SIZE as u64,
            footer_crc32: 0,
        };
        footer.footer_crc32 = crc32fast::hash(&footer.checksummed_bytes()?);
        let footer_bytes = encoding::encode_to_vec(&footer)?;
        self.write_raw(&footer_bytes)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;

        debug!(
            path = %self.final_path.display(),
            entries = properties.entry_count,
            blocks = data_block_count,
            bytes = self.offset,
            "SSTable written"
        );

        Ok(SstSummary {
            path: self.final_path.clone(),
            file_size: self.offset,
            entry_count: properties.entry_count,
            min_key: properties.min_key,
            max_key: properties.max_key,
            max_seq: properties.max_seq,
        })
    }

    fn write_header(&mut self) -> Result<(), SSTableError> {
        let mut header = Vec::with_capacity(12);
        SST_HDR_MAGIC.encode_to(&mut header)?;
        SST_HDR_VERSION.encode_to(&mut header)?;
        let crc = crc32fast::hash(&header);
        crc.encode_to(&mut header)?;
        self.write_raw(&header)
    }

    fn flush_data_block(&mut self) -> Result<(), SSTableError> {
        let block = mem::take(&mut self.current_block);
        let handle = self.write_checksummed_block(&block)?;
        let last_key = self.last_key.clone().ok_or_else(|| {
            SSTableError::Internal("data block flushed before any key was added".into())
        })?;
        self.index_entries.push(SSTableIndexEntry { last_key, handle });
        Ok(())
    }

    /// Writes `[len_le][data][crc32_le]` and returns its handle.
    fn write_checksummed_block(&mut self, data: &[u8]) -> Result<BlockHandle, SSTableError> {
        let offset = self.offset;
        let len = encoding::len_to_u32(data.len())?;
        let checksum = crc32fast::hash(data);

        if let Some(limiter) = &self.options.rate_limiter {
            limiter.acquire(data.len() as u64);
        }

        self.write_raw(&len.to_le_bytes())?;
        self.write_raw(data)?;
        self.write_raw(&checksum.to_le_bytes())?;

        Ok(BlockHandle {
            offset,
            size: (SST_BLOCK_LEN_SIZE + data.len() + SST_BLOCK_CHECKSUM_SIZE) as u64,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SSTableError> {
        self.writer.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            warn!(path = %self.tmp_path.display(), error = %e, "failed to remove temporary SSTable");
        }
    }
}

/// Make a rename in the parent directory durable.
pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), SSTableError> {
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
