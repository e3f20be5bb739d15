//! Visibility filter for merged record streams.
//!
//! [`VisibilityFilter`] wraps a sorted `(key ASC, seq DESC)` record
//! stream and yields only the **live** key-value pairs.

use crate::sstable::SSTableError;

use super::Record;

/// Filters a sorted record stream to yield only **visible** key-value pairs.
///
/// The first record of each key is its newest version: a `Put` is emitted,
/// a `Delete` hides the key. Every older version of the same key is skipped.
///
/// The input iterator **must** be sorted by `(key ASC, seq DESC)` and hold
/// only versions the reader may see, which is what
/// [`MergeIterator`](super::utils::MergeIterator) produces over
/// seq-filtered sources.
pub struct VisibilityFilter<I>
where
    I: Iterator<Item = Result<Record, SSTableError>>,
{
    /// Underlying merged record stream.
    input: I,
    /// The key most recently emitted or suppressed.
    current_key: Option<Vec<u8>>,
}

impl<I> VisibilityFilter<I>
where
    I: Iterator<Item = Result<Record, SSTableError>>,
{
    pub fn new(input: I) -> Self {
        Self {
            input,
            current_key: None,
        }
    }
}

impl<I> Iterator for VisibilityFilter<I>
where
    I: Iterator<Item = Result<Record, SSTableError>>,
{
    type Item = Result<(Vec<u8>, Vec<u8>), SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        for item in self.input.by_ref() {
            let record = match item {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };

            if self.current_key.as_deref() == Some(record.key()) {
                continue;
            }
            self.current_key = Some(record.key().to_vec());

            match record {
                Record::Put { key, value, .. } => return Some(Ok((key, value))),
                Record::Delete { .. } => {}
            }
        }

        None
    }
}
