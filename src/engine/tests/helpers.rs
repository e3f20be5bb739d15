use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig, KeyValue};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large write buffer: nothing leaves the active memtable on its own.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 1024 * 1024,
        ..EngineConfig::default()
    }
}

/// Tiny buffers and tables so rotations, flushes and compactions happen
/// after a handful of writes. Tombstones are dropped as soon as possible.
pub fn small_buffer_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 512,
        max_frozen_memtables: 64,
        level0_compaction_trigger: 4,
        level_base_size: 16 * 1024,
        level_size_multiplier: 4,
        target_file_size: 4 * 1024,
        block_size: 256,
        tombstone_retention: Duration::ZERO,
        background_retry_limit: 1,
        background_retry_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

pub fn put(engine: &Engine, key: &str, value: &str) {
    engine
        .put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), None)
        .unwrap();
}

pub fn delete(engine: &Engine, key: &str) {
    engine.delete(key.as_bytes().to_vec(), None).unwrap();
}

pub fn get(engine: &Engine, key: &str) -> Option<String> {
    engine
        .get(key.as_bytes(), None)
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

/// Write `key_<i>` → `val_<i>` until the active memtable rotates.
/// Returns the number of keys written.
pub fn fill_until_frozen(engine: &Engine, prefix: &str) -> usize {
    let before = engine.frozen_count();
    let mut i = 0;
    loop {
        put(engine, &format!("{prefix}_{i:04}"), &format!("val_{i:04}"));
        i += 1;
        if engine.frozen_count() > before {
            return i;
        }
        assert!(i < 10_000, "expected a rotation within 10000 puts");
    }
}

/// Open an engine with `count` keys spread over flushed level-0 tables.
pub fn engine_with_sstables(path: &Path, count: usize, prefix: &str) -> Engine {
    let engine = Engine::open(path, small_buffer_config()).unwrap();
    for i in 0..count {
        put(&engine, &format!("{prefix}_{i:04}"), &format!("value_with_padding_{i:04}"));
    }
    engine.flush_all().unwrap();
    assert!(engine.stats().sstables_count() > 0, "expected SSTables to be created");
    engine
}

pub fn collect_scan(engine: &Engine, start: &str, end: &str) -> Vec<(String, String)> {
    to_strings(engine.scan(start.as_bytes(), end.as_bytes(), u64::MAX, None).unwrap())
}

pub fn to_strings(pairs: Vec<KeyValue>) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .map(|(k, v)| (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()))
        .collect()
}

/// Number of files in `dir` with the given extension.
pub fn count_files(dir: &Path, ext: &str) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == ext))
        .count()
}
