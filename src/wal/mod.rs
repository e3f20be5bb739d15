//! Write-Ahead Logging (WAL) Module
//!
//! A **durable**, **append-only**, **generic** log of CRC-protected records.
//! The engine keeps one WAL segment per memtable generation, and the
//! manifest keeps its own event log in the same format.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header** — a [`WalHeader`] (20 bytes) followed by its CRC32.
//! - **Record** — 4-byte little-endian length, the record encoded with
//!   [`crate::encoding`], and a CRC32 computed over `len || record_bytes`.
//!
//! # Durability
//!
//! [`Wal::append`] writes one framed record at the tail and then applies the
//! segment's [`SyncPolicy`]: either `fsync` on every record, or once every
//! `max_writes` records with a background ticker calling [`Wal::sync`] every
//! `max_delay`. [`Wal::append_frames`] writes a group of frames encoded
//! with [`Wal::encode_frame`] the same way, applying the policy once for
//! the whole group.
//!
//! A failed write is rolled back by truncating the file to the previous
//! tail. If the rollback itself fails (or an `fsync` fails) the WAL is
//! **poisoned**: the on-disk state is unknown, so every later append is
//! refused with [`WalError::Poisoned`].
//!
//! # Recovery
//!
//! [`Wal::recover`] replays records in order and stops at the first
//! truncated or corrupt record. Everything from that point on was never
//! acknowledged, so the file is truncated back to the last valid record and
//! the valid prefix is returned.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    ffi::OsStr,
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crc32fast::Hasher as Crc32;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, ByteReader, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Encoded size of [`WalHeader`] without its checksum.
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

/// Offset of the first record.
pub const RECORDS_START: u64 = (HEADER_SIZE + U32_SIZE) as u64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a record failed.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Checksum mismatch.
    #[error("Checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// The file ends in the middle of a record.
    #[error("Unexpected end of file at offset {0}")]
    UnexpectedEof(u64),

    /// WAL header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// A previous write or sync failed and could not be rolled back.
    #[error("WAL is poisoned after an unrecoverable I/O failure")]
    Poisoned,

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Sync policy
// ------------------------------------------------------------------------------------------------

/// When appended records are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// `fsync` before every append returns.
    EveryWrite,

    /// `fsync` once `max_writes` records are pending, and at least every
    /// `max_delay` through a periodic [`Wal::sync`]. A crash may lose the
    /// unsynced window.
    Batched {
        max_writes: usize,
        max_delay: Duration,
    },
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::EveryWrite
    }
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every WAL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalHeader {
    /// Magic constant to identify WAL files (`b"BWAL"`).
    pub magic: [u8; 4],

    /// WAL format version.
    pub version: u32,

    /// Maximum record size (in bytes).
    pub max_record_size: u32,

    /// Segment number, also encoded in the file name.
    pub wal_seq: u64,
}

impl WalHeader {
    pub const MAGIC: [u8; 4] = *b"BWAL";
    pub const VERSION: u32 = 1;

    /// Default maximum record size (1 MiB).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 1024 * 1024;

    pub fn new(max_record_size: u32, wal_seq: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
            wal_seq,
        }
    }
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)?;
        self.wal_seq.encode_to(buf)
    }
}

impl Decode for WalHeader {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            magic: <[u8; 4]>::decode(reader)?,
            version: reader.read_u32()?,
            max_record_size: reader.read_u32()?,
            wal_seq: reader.read_u64()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Record types that can be written to and replayed from a [`Wal`].
pub trait WalData: Encode + Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: Encode + Decode + std::fmt::Debug + Send + Sync {}

/// Build the WAL file name for segment `seq`.
pub fn wal_file_name(seq: u64) -> String {
    format!("wal-{seq:06}.log")
}

/// Parse the segment number from a `wal-<seq>.log` file name.
pub fn parse_wal_seq(path: &Path) -> Option<u64> {
    let name = path.file_name().and_then(OsStr::to_str)?;
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct WalFile {
    file: File,
    /// Byte offset one past the last fully written record.
    tail: u64,
    pending_writes: usize,
    last_sync: Instant,
    poisoned: bool,
}

/// A generic, thread-safe Write-Ahead Log segment.
///
/// See the [module-level documentation](self) for format and guarantees.
#[derive(Debug)]
pub struct Wal<T: WalData> {
    file: Mutex<WalFile>,
    path: PathBuf,
    header: WalHeader,
    sync_policy: SyncPolicy,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Open or create a WAL file at `path`.
    ///
    /// A new file gets a fresh header (fsynced before returning). An
    /// existing file must carry a valid header whose sequence number matches
    /// the one in its name.
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_record_size: Option<u32>,
        sync_policy: SyncPolicy,
    ) -> Result<Self, WalError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let wal_seq = parse_wal_seq(path)
            .ok_or_else(|| WalError::Internal(format!("bad WAL name {}", path.display())))?;

        let len = file.metadata()?.len();
        let header = if len == 0 {
            let header = WalHeader::new(
                max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE),
                wal_seq,
            );
            let mut bytes = encoding::encode_to_vec(&header)?;
            let checksum = crc32fast::hash(&bytes);
            bytes.extend_from_slice(&checksum.to_le_bytes());
            file.write_all(&bytes)?;
            file.sync_all()?;

            debug!(path = %path.display(), "created WAL segment");
            header
        } else {
            let header = Self::read_header(&mut file, len)?;
            if header.wal_seq != wal_seq {
                return Err(WalError::InvalidHeader(format!(
                    "sequence {} does not match file name {}",
                    header.wal_seq,
                    path.display()
                )));
            }
            debug!(
                path = %path.display(),
                max_record_size = header.max_record_size,
                "opened existing WAL segment"
            );
            header
        };

        let tail = file.metadata()?.len();

        Ok(Self {
            file: Mutex::new(WalFile {
                file,
                tail,
                pending_writes: 0,
                last_sync: Instant::now(),
                poisoned: false,
            }),
            path: path.to_path_buf(),
            header,
            sync_policy,
            _phantom: std::marker::PhantomData,
        })
    }

    fn read_header(file: &mut File, len: u64) -> Result<WalHeader, WalError> {
        if len < RECORDS_START {
            return Err(WalError::InvalidHeader(format!(
                "file too short for header ({len} bytes)"
            )));
        }
        file.seek(SeekFrom::Start(0))?;
        let mut raw = [0u8; HEADER_SIZE + U32_SIZE];
        file.read_exact(&mut raw)?;

        let (header_bytes, crc_bytes) = raw.split_at(HEADER_SIZE);
        let mut stored = [0u8; U32_SIZE];
        stored.copy_from_slice(crc_bytes);
        if u32::from_le_bytes(stored) != crc32fast::hash(header_bytes) {
            return Err(WalError::InvalidHeader("header checksum mismatch".into()));
        }

        let header = encoding::decode_exact::<WalHeader>(header_bytes)?;
        if header.magic != WalHeader::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if header.version != WalHeader::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(header)
    }

    /// Append one record at the tail and return its starting offset.
    ///
    /// The record is durable on return under [`SyncPolicy::EveryWrite`]; under
    /// [`SyncPolicy::Batched`] it is durable after the next sync.
    pub fn append(&self, record: &T) -> Result<u64, WalError> {
        let frame = self.encode_frame(record)?;
        self.append_frames(&[frame])
    }

    /// Encode `record` into a complete `[len][payload][crc]` frame without
    /// writing it. Fails with [`WalError::RecordTooLarge`] when the payload
    /// exceeds the segment's record limit.
    pub fn encode_frame(&self, record: &T) -> Result<Vec<u8>, WalError> {
        let payload = encoding::encode_to_vec(record)?;
        if payload.len() > self.header.max_record_size as usize {
            return Err(WalError::RecordTooLarge(payload.len()));
        }
        let len = encoding::len_to_u32(payload.len())?.to_le_bytes();

        let mut hasher = Crc32::new();
        hasher.update(&len);
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&checksum.to_le_bytes());
        Ok(frame)
    }

    /// Write pre-encoded frames at the tail in one write and return the
    /// offset of the first. The sync policy is applied once for the whole
    /// group, so every frame shares a single `fsync`.
    ///
    /// Either all frames are appended or, after a rollback, none are.
    pub fn append_frames(&self, frames: &[Vec<u8>]) -> Result<u64, WalError> {
        let mut guard = self.file.lock();
        if guard.poisoned {
            return Err(WalError::Poisoned);
        }
        let offset = guard.tail;
        if frames.is_empty() {
            return Ok(offset);
        }

        let bytes = frames.concat();
        if let Err(e) = guard.file.write_all(&bytes) {
            Self::rollback(&mut guard, offset, &self.path);
            return Err(e.into());
        }
        guard.tail = offset + bytes.len() as u64;
        guard.pending_writes += frames.len();

        let must_sync = match self.sync_policy {
            SyncPolicy::EveryWrite => true,
            SyncPolicy::Batched { max_writes, .. } => guard.pending_writes >= max_writes,
        };
        if must_sync {
            if let Err(e) = Self::sync_locked(&mut guard) {
                Self::rollback(&mut guard, offset, &self.path);
                guard.poisoned = true;
                error!(path = %self.path.display(), error = %e, "WAL sync failed, segment poisoned");
                return Err(e);
            }
        }

        trace!(offset, frames = frames.len(), len = bytes.len(), "appended WAL records");
        Ok(offset)
    }

    fn rollback(guard: &mut WalFile, offset: u64, path: &Path) {
        match guard.file.set_len(offset) {
            Ok(()) => {
                guard.tail = offset;
                warn!(path = %path.display(), offset, "rolled back partial WAL write");
            }
            Err(e) => {
                guard.poisoned = true;
                error!(path = %path.display(), error = %e, "WAL rollback failed, segment poisoned");
            }
        }
    }

    fn sync_locked(guard: &mut WalFile) -> Result<(), WalError> {
        guard.file.sync_data()?;
        guard.pending_writes = 0;
        guard.last_sync = Instant::now();
        Ok(())
    }

    /// Force every appended record to stable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut guard = self.file.lock();
        if guard.poisoned {
            return Err(WalError::Poisoned);
        }
        if guard.pending_writes == 0 {
            return Ok(());
        }
        if let Err(e) = Self::sync_locked(&mut guard) {
            guard.poisoned = true;
            error!(path = %self.path.display(), error = %e, "WAL sync failed, segment poisoned");
            return Err(e);
        }
        Ok(())
    }

    /// Sync only when the batched window has expired.
    pub fn sync_if_due(&self) -> Result<(), WalError> {
        let due = match self.sync_policy {
            SyncPolicy::EveryWrite => false,
            SyncPolicy::Batched { max_delay, .. } => {
                let guard = self.file.lock();
                guard.pending_writes > 0 && guard.last_sync.elapsed() >= max_delay
            }
        };
        if due { self.sync() } else { Ok(()) }
    }

    /// Append and sync regardless of policy.
    pub fn append_sync(&self, record: &T) -> Result<u64, WalError> {
        let offset = self.append(record)?;
        self.sync()?;
        Ok(offset)
    }

    /// Create the segment that follows this one in the same directory.
    pub fn rotate_next(&self) -> Result<Wal<T>, WalError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| WalError::Internal("WAL path has no parent directory".into()))?;
        let next = dir.join(wal_file_name(self.seq() + 1));
        Wal::open(next, Some(self.max_record_size()), self.sync_policy)
    }

    /// Streaming iterator over every record, validating each checksum.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        let end = self.file.lock().tail;
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(RECORDS_START))?;

        Ok(WalIter {
            reader,
            offset: RECORDS_START,
            end,
            max_record_size: self.header.max_record_size as usize,
            failed: false,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Replay the valid prefix of the log and cut off whatever follows it.
    ///
    /// A truncated or corrupt record ends replay; the file is truncated to
    /// the end of the last good record so new appends continue from there.
    pub fn recover(&self) -> Result<Vec<T>, WalError> {
        let mut iter = self.replay_iter()?;
        let mut records = Vec::new();
        let mut valid_end = RECORDS_START;

        while let Some(item) = iter.next() {
            match item {
                Ok(record) => {
                    records.push(record);
                    valid_end = iter.offset();
                }
                Err(WalError::Io(e)) => return Err(WalError::Io(e)),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        offset = valid_end,
                        error = %e,
                        "discarding unflushed WAL tail"
                    );
                    break;
                }
            }
        }

        let mut guard = self.file.lock();
        if valid_end < guard.tail {
            guard.file.set_len(valid_end)?;
            guard.file.sync_all()?;
            guard.tail = valid_end;
        }

        info!(
            path = %self.path.display(),
            records = records.len(),
            "WAL recovered"
        );
        Ok(records)
    }

    /// Clear every record, keeping only the header.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut guard = self.file.lock();
        if guard.poisoned {
            return Err(WalError::Poisoned);
        }
        guard.file.set_len(RECORDS_START)?;
        guard.file.sync_all()?;
        guard.tail = RECORDS_START;
        guard.pending_writes = 0;

        debug!(path = %self.path.display(), "truncated WAL");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.header.wal_seq
    }

    pub fn max_record_size(&self) -> u32 {
        self.header.max_record_size
    }

    /// Current file length in bytes, header included.
    pub fn len(&self) -> u64 {
        self.file.lock().tail
    }

    pub fn is_empty(&self) -> bool {
        self.len() == RECORDS_START
    }

    pub fn is_poisoned(&self) -> bool {
        self.file.lock().poisoned
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        let guard = self.file.get_mut();
        if guard.poisoned || guard.pending_writes == 0 {
            return;
        }
        if let Err(e) = guard.file.sync_data() {
            error!(path = %self.path.display(), error = %e, "failed to sync WAL on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming WAL replay iterator.
///
/// Reads through its own file handle, one record at a time, up to the tail
/// observed when it was created. After the first error it yields nothing.
pub struct WalIter<T: WalData> {
    reader: BufReader<File>,
    offset: u64,
    end: u64,
    max_record_size: usize,
    failed: bool,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> WalIter<T> {
    /// Offset one past the last record returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_record(&mut self) -> Result<T, WalError> {
        let start = self.offset;
        let remaining = self.end - start;
        if remaining < (2 * U32_SIZE) as u64 {
            return Err(WalError::UnexpectedEof(start));
        }

        let mut len_bytes = [0u8; U32_SIZE];
        self.reader.read_exact(&mut len_bytes)?;
        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len));
        }
        if remaining < (record_len + 2 * U32_SIZE) as u64 {
            return Err(WalError::UnexpectedEof(start));
        }

        let mut record_bytes = vec![0u8; record_len];
        self.reader.read_exact(&mut record_bytes)?;
        let mut checksum_bytes = [0u8; U32_SIZE];
        self.reader.read_exact(&mut checksum_bytes)?;

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        if hasher.finalize() != u32::from_le_bytes(checksum_bytes) {
            return Err(WalError::ChecksumMismatch(start));
        }

        let record = encoding::decode_exact::<T>(&record_bytes)?;
        self.offset = start + (record_len + 2 * U32_SIZE) as u64;
        Ok(record)
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.end {
            return None;
        }
        let result = self.read_record();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}
