//! Ordered iteration over an SSTable.
//!
//! [`SSTableIter`] walks data blocks in index order and yields every stored
//! version as a [`Record`], in `(key ASC, seq DESC)` order. Visibility rules
//! are left to the caller; this iterator returns raw versions, tombstones
//! included.
//!
//! The iterator owns an `Arc` of its table, so it stays valid after the
//! table has been compacted away and marked obsolete.

use std::{ops::Bound, sync::Arc};

use crate::encoding::ByteReader;
use crate::engine::utils::Record;

use super::{BlockEntry, SSTable, SSTableError};

/// Iterator over the versions stored in one table.
pub struct SSTableIter {
    table: Arc<SSTable>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,

    next_block: usize,
    /// Index of the block being read; its checksum has been verified.
    block: Option<usize>,
    block_len: usize,
    block_pos: usize,
    done: bool,
}

impl SSTableIter {
    pub(crate) fn new(table: Arc<SSTable>, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        // Skip straight to the first block that can hold the start key.
        let next_block = match &start {
            Bound::Included(key) | Bound::Excluded(key) => table
                .find_block_for_key(key)
                .unwrap_or_else(|| table.block_count()),
            Bound::Unbounded => 0,
        };

        Self {
            table,
            start,
            end,
            next_block,
            block: None,
            block_len: 0,
            block_pos: 0,
            done: false,
        }
    }

    /// Verifies and moves to the next block. Returns `Ok(false)` when all
    /// blocks are consumed.
    fn load_next_block(&mut self) -> Result<bool, SSTableError> {
        if self.next_block >= self.table.block_count() {
            return Ok(false);
        }
        self.block_len = self.table.read_data_block(self.next_block)?.len();
        self.block = Some(self.next_block);
        self.block_pos = 0;
        self.next_block += 1;
        Ok(true)
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn advance(&mut self) -> Result<Option<Record>, SSTableError> {
        loop {
            if self.block_pos >= self.block_len && !self.load_next_block()? {
                return Ok(None);
            }
            let Some(idx) = self.block else {
                return Ok(None);
            };

            let block = self.table.data_block_payload(idx)?;
            let mut reader = ByteReader::new(&block[self.block_pos..]);
            let cell = BlockEntry::decode_cell(&mut reader)?;
            self.block_pos += reader.position();

            if self.before_start(cell.key) {
                continue;
            }
            if self.past_end(cell.key) {
                return Ok(None);
            }

            return Ok(Some(match cell.value {
                Some(value) => Record::Put {
                    key: cell.key.to_vec(),
                    value: value.to_vec(),
                    seq: cell.seq,
                    timestamp: cell.timestamp,
                },
                None => Record::Delete {
                    key: cell.key.to_vec(),
                    seq: cell.seq,
                    timestamp: cell.timestamp,
                },
            }));
        }
    }
}

impl Iterator for SSTableIter {
    type Item = Result<Record, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
