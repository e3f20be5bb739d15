//! Sorted String Table (SSTable) Module
//!
//! Immutable, disk-backed, sorted files holding every version of the keys
//! they cover. Point lookups touch at most one data block, guided by a
//! sparse index and an optional bloom filter; all reads go through a
//! memory-mapped, bounds-checked view of the file.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_FILTER_LEN_LE][BLOOM_FILTER_BYTES][BLOOM_FILTER_CRC32_LE]   (optional)
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [METAINDEX_LEN_LE][METAINDEX_BYTES][METAINDEX_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header** — magic `b"BSST"` and format version, followed by a CRC32.
//! - **Data blocks** — cells ordered by `(key ASC, seq DESC)`. All versions
//!   of one key live in the same block.
//! - **Bloom filter** — membership filter over distinct keys, sized by
//!   bits-per-key. Absent when the filter is disabled.
//! - **Properties** — key range, sequence range, timestamps and counts.
//! - **Metaindex** — named handles for the bloom and properties blocks.
//! - **Index** — sparse index: the **last** key of each data block and the
//!   block's handle.
//! - **Footer** — handles of the metaindex and index, the total file size
//!   and a CRC32 (44 bytes).
//!
//! # Cell format
//!
//! ```text
//! [seq u64][timestamp u64][kind u8: 0=put 1=delete][u32 key_len][key][u32 value_len][value]
//! ```
//!
//! The value part is omitted for tombstones; a put may carry a zero-length
//! value.
//!
//! # Concurrency and lifetime
//!
//! Tables are shared as `Arc<SSTable>`. Reads need no locks because the
//! bytes never change. Compaction marks replaced tables with
//! [`SSTable::mark_obsolete`]; the file is unlinked when the last reference
//! is dropped, so an in-flight read never loses its file.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;
pub mod mmap;

#[cfg(test)]
mod tests;

pub use builder::{SstWriter, SstWriterOptions};
pub use iterator::SSTableIter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    io,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bloomfilter::Bloom;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::encoding::{self, ByteReader, Decode, Encode, EncodingError};
use mmap::MappedFile;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const SST_HDR_MAGIC: [u8; 4] = *b"BSST";
const SST_HDR_VERSION: u32 = 1;
const SST_HDR_SIZE: usize = 12;
const SST_FOOTER_SIZE: usize = 44;
const SST_BLOCK_LEN_SIZE: usize = 4;
const SST_BLOCK_CHECKSUM_SIZE: usize = 4;

const META_BLOOM: &str = "filter.bloom";
const META_PROPERTIES: &str = "meta.properties";

const CELL_PUT: u8 = 0;
const CELL_DELETE: u8 = 1;

/// File name for table `id`.
pub fn sst_file_name(id: u64) -> String {
    format!("{id:06}.sst")
}

/// Parse the table id from a `<id>.sst` file name.
pub fn parse_sst_id(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_suffix(".sst")?
        .parse::<u64>()
        .ok()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block's stored checksum does not match its contents.
    #[error("Checksum mismatch in block at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    /// Structural damage: bad magic, truncated block, out-of-range handle.
    #[error("Corrupt SSTable: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Location of a framed block: offset of its length prefix and the full
/// frame size including prefix and checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

/// Table-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSTablePropertiesBlock {
    /// Creation time (UNIX epoch nanos).
    pub creation_timestamp: u64,
    pub entry_count: u64,
    pub tombstone_count: u64,
    pub data_block_count: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// Sparse index entry: the last key stored in a data block.
#[derive(Debug, Clone)]
pub(crate) struct SSTableIndexEntry {
    pub(crate) last_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

#[derive(Debug)]
pub(crate) struct MetaIndexEntry {
    pub(crate) name: String,
    pub(crate) handle: BlockHandle,
}

#[derive(Debug)]
pub(crate) struct SSTableFooter {
    pub(crate) metaindex: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) total_file_size: u64,
    pub(crate) footer_crc32: u32,
}

/// A cell borrowed straight out of a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry<'a> {
    pub key: &'a [u8],
    /// `None` for a tombstone.
    pub value: Option<&'a [u8]>,
    pub seq: u64,
    pub timestamp: u64,
}

impl BlockEntry<'_> {
    pub(crate) fn decode_cell<'a>(
        reader: &mut ByteReader<'a>,
    ) -> Result<BlockEntry<'a>, EncodingError> {
        let seq = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let kind = reader.read_u8()?;
        let key = reader.read_bytes()?;
        let value = match kind {
            CELL_PUT => Some(reader.read_bytes()?),
            CELL_DELETE => None,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "BlockEntry",
                });
            }
        };
        Ok(BlockEntry {
            key,
            value,
            seq,
            timestamp,
        })
    }

    pub(crate) fn encode_cell(
        key: &[u8],
        value: Option<&[u8]>,
        seq: u64,
        timestamp: u64,
        buf: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        seq.encode_to(buf)?;
        timestamp.encode_to(buf)?;
        match value {
            Some(value) => {
                CELL_PUT.encode_to(buf)?;
                encoding::encode_bytes(key, buf)?;
                encoding::encode_bytes(value, buf)
            }
            None => {
                CELL_DELETE.encode_to(buf)?;
                encoding::encode_bytes(key, buf)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            offset: reader.read_u64()?,
            size: reader.read_u64()?,
        })
    }
}

impl Encode for SSTablePropertiesBlock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.creation_timestamp.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.data_block_count.encode_to(buf)?;
        self.min_seq.encode_to(buf)?;
        self.max_seq.encode_to(buf)?;
        self.min_timestamp.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)
    }
}

impl Decode for SSTablePropertiesBlock {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            creation_timestamp: reader.read_u64()?,
            entry_count: reader.read_u64()?,
            tombstone_count: reader.read_u64()?,
            data_block_count: reader.read_u64()?,
            min_seq: reader.read_u64()?,
            max_seq: reader.read_u64()?,
            min_timestamp: reader.read_u64()?,
            max_timestamp: reader.read_u64()?,
            min_key: Vec::<u8>::decode(reader)?,
            max_key: Vec::<u8>::decode(reader)?,
        })
    }
}

impl Encode for SSTableIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_key.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for SSTableIndexEntry {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            last_key: Vec::<u8>::decode(reader)?,
            handle: BlockHandle::decode(reader)?,
        })
    }
}

impl Encode for MetaIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for MetaIndexEntry {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            name: String::decode(reader)?,
            handle: BlockHandle::decode(reader)?,
        })
    }
}

impl SSTableFooter {
    /// Bytes covered by the footer checksum.
    fn checksummed_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::with_capacity(SST_FOOTER_SIZE);
        self.metaindex.encode_to(&mut buf)?;
        self.index.encode_to(&mut buf)?;
        self.total_file_size.encode_to(&mut buf)?;
        Ok(buf)
    }
}

impl Encode for SSTableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.checksummed_bytes()?);
        self.footer_crc32.encode_to(buf)
    }
}

impl Decode for SSTableFooter {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            metaindex: BlockHandle::decode(reader)?,
            index: BlockHandle::decode(reader)?,
            total_file_size: reader.read_u64()?,
            footer_crc32: reader.read_u32()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// GetResult
// ------------------------------------------------------------------------------------------------

/// Result of a single key lookup in an SSTable.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GetResult {
    /// A value stored in this table.
    Put {
        value: Vec<u8>,
        seq: u64,
        timestamp: u64,
    },

    /// A tombstone for this key.
    Delete { seq: u64, timestamp: u64 },

    /// This table has no visible version of the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// SSTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable Sorted String Table.
pub struct SSTable {
    id: u64,
    path: PathBuf,
    file: MappedFile,
    bloom: Option<Bloom<[u8]>>,
    properties: SSTablePropertiesBlock,
    index: Vec<SSTableIndexEntry>,
    file_size: u64,
    obsolete: AtomicBool,
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("entries", &self.properties.entry_count)
            .finish()
    }
}

impl SSTable {
    /// Open and validate the table at `path`.
    ///
    /// Header, footer, metaindex, properties, bloom and index blocks are
    /// checksum-verified here; data blocks are verified when first read.
    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let file = MappedFile::open(path)?;
        let file_len = file.len();
        if file_len < SST_HDR_SIZE + SST_FOOTER_SIZE {
            return Err(SSTableError::Corrupt(format!(
                "file too small ({file_len} bytes)"
            )));
        }

        // 1) Header
        let header = file.slice(0, SST_HDR_SIZE as u64)?;
        let mut reader = ByteReader::new(header);
        let magic = <[u8; 4]>::decode(&mut reader)?;
        let version = reader.read_u32()?;
        let header_crc = reader.read_u32()?;
        if header_crc != crc32fast::hash(&header[..8]) {
            return Err(SSTableError::ChecksumMismatch { offset: 0 });
        }
        if magic != SST_HDR_MAGIC {
            return Err(SSTableError::Corrupt("header magic mismatch".into()));
        }
        if version != SST_HDR_VERSION {
            return Err(SSTableError::Corrupt(format!(
                "unsupported version {version}"
            )));
        }

        // 2) Footer
        let footer_start = (file_len - SST_FOOTER_SIZE) as u64;
        let footer_bytes = file.slice(footer_start, SST_FOOTER_SIZE as u64)?;
        let footer = encoding::decode_exact::<SSTableFooter>(footer_bytes)?;
        if footer.footer_crc32 != crc32fast::hash(&footer.checksummed_bytes()?) {
            return Err(SSTableError::ChecksumMismatch {
                offset: footer_start,
            });
        }
        if footer.total_file_size != file_len as u64 {
            return Err(SSTableError::Corrupt(format!(
                "footer records {} bytes, file has {file_len}",
                footer.total_file_size
            )));
        }

        // 3) Metaindex → properties and optional bloom
        let mut reader = ByteReader::new(read_block(&file, footer.metaindex)?);
        let meta_entries: Vec<MetaIndexEntry> = encoding::decode_vec(&mut reader)?;

        let mut bloom_handle = None;
        let mut properties_handle = None;
        for entry in meta_entries {
            match entry.name.as_str() {
                META_BLOOM => bloom_handle = Some(entry.handle),
                META_PROPERTIES => properties_handle = Some(entry.handle),
                other => {
                    return Err(SSTableError::Corrupt(format!(
                        "unknown metaindex entry {other:?}"
                    )));
                }
            }
        }

        let properties_handle = properties_handle
            .ok_or_else(|| SSTableError::Corrupt("missing properties block".into()))?;
        let properties =
            encoding::decode_exact::<SSTablePropertiesBlock>(read_block(&file, properties_handle)?)?;

        let bloom = match bloom_handle {
            Some(handle) => Some(
                Bloom::from_slice(read_block(&file, handle)?)
                    .map_err(|e| SSTableError::Corrupt(format!("bloom filter: {e}")))?,
            ),
            None => None,
        };

        // 4) Index
        let mut reader = ByteReader::new(read_block(&file, footer.index)?);
        let index: Vec<SSTableIndexEntry> = encoding::decode_vec(&mut reader)?;
        reader.finish()?;

        debug!(
            id,
            path = %path.display(),
            entries = properties.entry_count,
            blocks = index.len(),
            mapped = file.is_mapped(),
            "opened SSTable"
        );

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file_size: file_len as u64,
            file,
            bloom,
            properties,
            index,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// On-disk size of this table in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn properties(&self) -> &SSTablePropertiesBlock {
        &self.properties
    }

    pub fn min_key(&self) -> &[u8] {
        &self.properties.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.properties.max_key
    }

    pub fn max_seq(&self) -> u64 {
        self.properties.max_seq
    }

    pub fn has_bloom(&self) -> bool {
        self.bloom.is_some()
    }

    /// Whether `[start, end]` (inclusive) intersects this table's key range.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.min_key() <= end && start <= self.max_key()
    }

    /// `false` only when the bloom filter proves `key` is absent.
    pub fn bloom_may_contain(&self, key: &[u8]) -> bool {
        self.bloom.as_ref().is_none_or(|bloom| bloom.check(key))
    }

    /// Newest version of `key` with sequence number `<= read_seq`.
    ///
    /// Consults the key range and bloom filter first, then the single data
    /// block the sparse index points at.
    pub fn get(&self, key: &[u8], read_seq: u64) -> Result<GetResult, SSTableError> {
        if key < self.min_key() || key > self.max_key() {
            return Ok(GetResult::NotFound);
        }
        if !self.bloom_may_contain(key) {
            trace!(id = self.id, "bloom filter excluded key");
            return Ok(GetResult::NotFound);
        }

        let Some(block_idx) = self.find_block_for_key(key) else {
            return Ok(GetResult::NotFound);
        };
        let block = self.read_data_block(block_idx)?;
        let mut reader = ByteReader::new(block);

        while !reader.is_empty() {
            let cell = BlockEntry::decode_cell(&mut reader)?;
            if cell.key > key {
                break;
            }
            if cell.key < key || cell.seq > read_seq {
                continue;
            }
            return Ok(match cell.value {
                Some(value) => GetResult::Put {
                    value: value.to_vec(),
                    seq: cell.seq,
                    timestamp: cell.timestamp,
                },
                None => GetResult::Delete {
                    seq: cell.seq,
                    timestamp: cell.timestamp,
                },
            });
        }
        Ok(GetResult::NotFound)
    }

    /// Ordered iterator over every version in the table.
    pub fn iter(self: &Arc<Self>) -> SSTableIter {
        SSTableIter::new(Arc::clone(self), Bound::Unbounded, Bound::Unbounded)
    }

    /// Ordered iterator over versions of keys within the given bounds.
    pub fn scan(self: &Arc<Self>, start: Bound<&[u8]>, end: Bound<&[u8]>) -> SSTableIter {
        SSTableIter::new(
            Arc::clone(self),
            start.map(<[u8]>::to_vec),
            end.map(<[u8]>::to_vec),
        )
    }

    /// Flag the file for deletion once the last reference is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Index of the first block whose last key is `>= key`.
    pub(crate) fn find_block_for_key(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .index
            .partition_point(|entry| entry.last_key.as_slice() < key);
        (idx < self.index.len()).then_some(idx)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Checksum-verified payload of data block `idx`, borrowed from the map.
    pub(crate) fn read_data_block(&self, idx: usize) -> Result<&[u8], SSTableError> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| SSTableError::Internal(format!("block {idx} out of range")))?;
        read_block(&self.file, entry.handle)
    }

    /// Payload of data block `idx` without re-checking its checksum, for
    /// iterators that already verified it through [`Self::read_data_block`].
    pub(crate) fn data_block_payload(&self, idx: usize) -> Result<&[u8], SSTableError> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| SSTableError::Internal(format!("block {idx} out of range")))?;
        let overhead = (SST_BLOCK_LEN_SIZE + SST_BLOCK_CHECKSUM_SIZE) as u64;
        let len = entry.handle.size.checked_sub(overhead).ok_or_else(|| {
            SSTableError::Corrupt(format!("block {idx} shorter than its frame"))
        })?;
        self.file
            .slice(entry.handle.offset + SST_BLOCK_LEN_SIZE as u64, len)
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(id = self.id, path = %self.path.display(), "deleted obsolete SSTable"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                id = self.id,
                path = %self.path.display(),
                error = %e,
                "failed to delete obsolete SSTable"
            ),
        }
    }
}

/// Reads a framed block and verifies its checksum, without copying.
pub(crate) fn read_block(file: &MappedFile, handle: BlockHandle) -> Result<&[u8], SSTableError> {
    let frame = file.slice(handle.offset, handle.size)?;
    let overhead = SST_BLOCK_LEN_SIZE + SST_BLOCK_CHECKSUM_SIZE;
    if frame.len() < overhead {
        return Err(SSTableError::Corrupt(format!(
            "block at offset {} shorter than its frame",
            handle.offset
        )));
    }

    let mut reader = ByteReader::new(frame);
    let content_len = reader.read_u32()? as usize;
    if content_len + overhead != frame.len() {
        return Err(SSTableError::Corrupt(format!(
            "block at offset {} has length {content_len}, handle says {}",
            handle.offset, handle.size
        )));
    }
    let content = reader.take(content_len)?;
    let stored = reader.read_u32()?;
    if crc32fast::hash(content) != stored {
        return Err(SSTableError::ChecksumMismatch {
            offset: handle.offset,
        });
    }
    Ok(content)
}
