//! Fixtures for compaction tests: tables built straight from records.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::compaction::MergeOptions;
use crate::engine::utils::Record;
use crate::sstable::{SSTable, SstWriter, SstWriterOptions, sst_file_name};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Put with a timestamp far in the past.
pub fn put(key: &str, value: &str, seq: u64) -> Record {
    Record::Put {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        seq,
        timestamp: seq,
    }
}

/// Tombstone with a timestamp far in the past.
pub fn del(key: &str, seq: u64) -> Record {
    Record::Delete {
        key: key.as_bytes().to_vec(),
        seq,
        timestamp: seq,
    }
}

/// Builds `sst/<id>.sst` from records that are already sorted.
pub fn table(dir: &Path, id: u64, records: &[Record]) -> Arc<SSTable> {
    let path = dir.join(sst_file_name(id));
    let mut writer = SstWriter::create(&path, SstWriterOptions::default()).unwrap();
    for record in records {
        writer.add(record).unwrap();
    }
    writer.finish().unwrap();
    Arc::new(SSTable::open(&path, id).unwrap())
}

/// Table holding `count` keys `prefix000..` with a filler value of `value_len` bytes.
pub fn sized_table(dir: &Path, id: u64, prefix: &str, count: usize, value_len: usize) -> Arc<SSTable> {
    let value = "x".repeat(value_len);
    let records: Vec<_> = (0..count)
        .map(|i| put(&format!("{prefix}{i:04}"), &value, id * 10_000 + i as u64))
        .collect();
    table(dir, id, &records)
}

pub fn merge_options() -> MergeOptions {
    MergeOptions {
        target_file_size: 64 * 1024 * 1024,
        block_size: 4096,
        bloom_bits_per_key: 10,
        tombstone_retention: Duration::ZERO,
        rate_limiter: None,
    }
}

/// Every record of every table, in order.
pub fn dump(tables: &[Arc<SSTable>]) -> Vec<(String, u64, Option<String>)> {
    tables
        .iter()
        .flat_map(|t| t.iter().map(|r| r.unwrap()))
        .map(|r| {
            (
                String::from_utf8(r.key().to_vec()).unwrap(),
                r.seq(),
                r.value().map(|v| String::from_utf8(v.to_vec()).unwrap()),
            )
        })
        .collect()
}
