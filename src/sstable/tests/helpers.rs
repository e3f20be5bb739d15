//! Shared fixtures for SSTable tests.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::engine::utils::Record;
use crate::sstable::{SSTable, SstWriter, SstWriterOptions};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn put(key: &[u8], value: &[u8], seq: u64) -> Record {
    Record::Put {
        key: key.to_vec(),
        value: value.to_vec(),
        seq,
        timestamp: seq * 10,
    }
}

pub fn del(key: &[u8], seq: u64) -> Record {
    Record::Delete {
        key: key.to_vec(),
        seq,
        timestamp: seq * 10,
    }
}

/// Writes `records` (already sorted) with the given options and opens the result.
pub fn build_with(path: &Path, records: &[Record], options: SstWriterOptions) -> Arc<SSTable> {
    let mut writer = SstWriter::create(path, options).unwrap();
    for record in records {
        writer.add(record).unwrap();
    }
    writer.finish().unwrap();
    Arc::new(SSTable::open(path, 1).unwrap())
}

pub fn build(path: &Path, records: &[Record]) -> Arc<SSTable> {
    build_with(path, records, SstWriterOptions::default())
}

/// Unwraps every item of an SSTable iterator.
pub fn collect(iter: impl Iterator<Item = Result<Record, crate::sstable::SSTableError>>) -> Vec<Record> {
    iter.map(|r| r.unwrap()).collect()
}
