//! Read-only view of an SSTable file.
//!
//! [`MappedFile`] hides the memory map behind bounds-checked slice reads so
//! no raw pointer into the mapping ever escapes. The map lives as long as
//! the owning [`SSTable`](super::SSTable), and tables are shared through
//! `Arc`, so a slice can never outlive its mapping.

use std::{fs::File, io::Read, path::Path};

use memmap2::Mmap;
use tracing::warn;

use super::SSTableError;

/// Immutable file contents, memory-mapped where the platform allows it.
pub enum MappedFile {
    Mapped(Mmap),
    /// Fallback when mapping fails, e.g. on filesystems without mmap support.
    Buffered(Vec<u8>),
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self, SSTableError> {
        let mut file = File::open(path)?;

        // SAFETY: SSTable files are written to a temp path and renamed into
        // place; nothing opens them for writing afterwards. The mapping is
        // read-only and every access goes through `slice`.
        match unsafe { Mmap::map(&file) } {
            Ok(mmap) => Ok(Self::Mapped(mmap)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "mmap failed, reading file into memory");
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(Self::Buffered(buf))
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Buffered(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }

    /// Borrow `len` bytes at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8], SSTableError> {
        let bytes = self.bytes();
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, len, bytes.len()))?;
        let len_usize = usize::try_from(len).map_err(|_| out_of_range(offset, len, bytes.len()))?;
        let end = start
            .checked_add(len_usize)
            .ok_or_else(|| out_of_range(offset, len, bytes.len()))?;
        bytes
            .get(start..end)
            .ok_or_else(|| out_of_range(offset, len, bytes.len()))
    }
}

fn out_of_range(offset: u64, len: u64, file_len: usize) -> SSTableError {
    SSTableError::Corrupt(format!(
        "range {offset}+{len} outside file of {file_len} bytes"
    ))
}
