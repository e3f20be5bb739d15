//! Write path failures and the commit queue.
//!
//! A write that is refused, rejected by the WAL or times out before it is
//! committed must leave no trace: not in the memtable, not in `last_seq`,
//! not after a reopen. A damaged table must surface as an error naming the
//! table, never as a wrong value.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineConfig, EngineError, SST_DIR};
    use crate::memtable::MemtableError;
    use crate::sstable::{SSTableError, sst_file_name};
    use crate::wal::WalError;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn tiny_record_config() -> EngineConfig {
        EngineConfig {
            max_record_size: 128,
            ..memtable_only_config()
        }
    }

    /// # Scenario
    /// The WAL rejects a record larger than its limit.
    ///
    /// # Starting environment
    /// Engine with a 128-byte record limit and one acknowledged write.
    ///
    /// # Actions
    /// 1. Put a 1000-byte value.
    /// 2. Reopen.
    ///
    /// # Expected behavior
    /// The put fails with `RecordTooLarge`; `last_seq` stays at 1 and the
    /// key is absent, both before and after the reopen. The next write
    /// takes sequence number 2.
    #[test]
    fn wal_reject__leaves_no_trace() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open(tmp.path(), tiny_record_config()).unwrap();
            put(&engine, "a", "1");

            let err = engine
                .put(b"big".to_vec(), vec![b'x'; 1000], None)
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    EngineError::Memtable(MemtableError::Wal(WalError::RecordTooLarge(_)))
                ),
                "unexpected error: {err:?}"
            );
            assert_eq!(engine.last_seq(), 1);
            assert_eq!(get(&engine, "big"), None);
        }

        let engine = Engine::open(tmp.path(), tiny_record_config()).unwrap();
        assert_eq!(engine.last_seq(), 1);
        assert_eq!(get(&engine, "big"), None);
        assert_eq!(get(&engine, "a").as_deref(), Some("1"));

        put(&engine, "b", "2");
        assert_eq!(engine.last_seq(), 2);
    }

    /// # Scenario
    /// A writer times out while another thread holds the write path.
    ///
    /// # Actions
    /// 1. Hold the writer lock.
    /// 2. From another thread, put with a 50 ms deadline.
    /// 3. Release the lock and put a different key.
    ///
    /// # Expected behavior
    /// The timed-out put returns `Timeout`, is withdrawn from the commit
    /// queue and never applied; the later put gets sequence number 1.
    #[test]
    fn timeout__withdrawn_write_never_applies() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

        let held = engine.inner.writer.lock();
        let writer = {
            let engine = engine.clone();
            thread::spawn(move || {
                engine.put(
                    b"late".to_vec(),
                    b"v".to_vec(),
                    Some(Instant::now() + Duration::from_millis(50)),
                )
            })
        };
        let result = writer.join().unwrap();
        drop(held);

        assert!(matches!(result, Err(EngineError::Timeout)));
        assert!(engine.inner.commit_queue.lock().is_empty());

        put(&engine, "next", "v");
        assert_eq!(engine.last_seq(), 1);
        assert_eq!(get(&engine, "late"), None);
    }

    /// # Scenario
    /// Writers queue up behind a slow commit and are committed as a group.
    ///
    /// # Actions
    /// 1. Hold the writer lock while 6 threads issue one put each.
    /// 2. Release it.
    ///
    /// # Expected behavior
    /// Every put succeeds; sequence numbers 1..=6 are all used exactly
    /// once and every key survives a reopen.
    #[test]
    fn group_commit__queued_writers_all_applied() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

            let held = engine.inner.writer.lock();
            let writers: Vec<_> = (0..6)
                .map(|i| {
                    let engine = engine.clone();
                    thread::spawn(move || {
                        engine.put(format!("w{i}").into_bytes(), format!("v{i}").into_bytes(), None)
                    })
                })
                .collect();
            while engine.inner.commit_queue.lock().len() < 6 {
                thread::sleep(Duration::from_millis(1));
            }
            drop(held);

            for writer in writers {
                writer.join().unwrap().unwrap();
            }
            assert_eq!(engine.last_seq(), 6);
            assert!(engine.inner.commit_queue.lock().is_empty());
        }

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.last_seq(), 6);
        for i in 0..6 {
            assert_eq!(get(&engine, &format!("w{i}")), Some(format!("v{i}")));
        }
    }

    /// # Scenario
    /// Concurrent writers under per-write durability.
    ///
    /// # Expected behavior
    /// No write is lost or duplicated: `last_seq` equals the number of
    /// writes and every key reads back after a reopen.
    #[test]
    fn group_commit__concurrent_writers_every_write_sync() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 100;

        let tmp = TempDir::new().unwrap();
        {
            let engine = Arc::new(Engine::open(tmp.path(), memtable_only_config()).unwrap());
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        for i in 0..PER_THREAD {
                            put(&engine, &format!("t{t}_{i:03}"), &format!("{t}:{i}"));
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(engine.last_seq(), (THREADS * PER_THREAD) as u64);
        }

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        assert_eq!(engine.last_seq(), (THREADS * PER_THREAD) as u64);
        for t in 0..THREADS {
            for i in 0..PER_THREAD {
                assert_eq!(
                    get(&engine, &format!("t{t}_{i:03}")),
                    Some(format!("{t}:{i}"))
                );
            }
        }
    }

    /// # Scenario
    /// A data block of a flushed table is damaged on disk.
    ///
    /// # Actions
    /// 1. Put `k`, flush to a single table, crash.
    /// 2. Flip one byte inside the first data block.
    /// 3. Reopen; get `k`, get a key outside the table, scan.
    ///
    /// # Expected behavior
    /// `get(k)` fails with `Table` naming that table and a checksum
    /// mismatch; the key outside the table's range still reads `None`; the
    /// scan fails instead of returning partial data.
    #[test]
    fn corrupt_table__point_read_names_table() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
            put(&engine, "k", "value");
            engine.flush_all().unwrap();
            let tables = engine.sstables();
            assert_eq!(tables.len(), 1);
            tables[0].id
        };

        // 12-byte file header, then the first block's 4-byte length.
        let path = tmp.path().join(SST_DIR).join(sst_file_name(id));
        let mut bytes = fs::read(&path).unwrap();
        bytes[16] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        match engine.get(b"k", None) {
            Err(EngineError::Table {
                id: failed,
                key,
                source: SSTableError::ChecksumMismatch { .. },
            }) => {
                assert_eq!(failed, id);
                assert_eq!(key, b"k");
            }
            other => panic!("expected a table error, got {other:?}"),
        }
        assert_eq!(get(&engine, "a"), None);
        assert!(engine.scan(b"a", b"z", u64::MAX, None).is_err());
    }
}
