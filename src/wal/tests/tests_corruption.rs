//! WAL corruption detection and tail recovery.
//!
//! Corruption is simulated by writing directly into the WAL file.
//!
//! Coverage:
//! - Header checksum mismatch → `WalError::InvalidHeader`
//! - Flipped payload byte → `WalError::ChecksumMismatch` during replay
//! - Torn final record → `WalError::UnexpectedEof` during replay
//! - `recover()` returns the valid prefix and truncates the rest
//!
//! ## See also
//! - [`tests_basic`] — append / replay / truncate cycle

#[cfg(test)]
mod tests {
    use crate::wal::tests::helpers::*;
    use crate::wal::{RECORDS_START, SyncPolicy, Wal, WalError, wal_file_name};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn overwrite(path: &std::path::Path, offset: u64, bytes: &[u8]) {
        let mut f = OpenOptions::new().write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(bytes).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn corrupted_header_checksum() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        drop(open_wal(&path));

        overwrite(&path, 2, &[0x99]);

        let err = Wal::<TestRecord>::open(&path, None, SyncPolicy::EveryWrite).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
        assert!(err.to_string().contains("header checksum mismatch"));
    }

    /// # Scenario
    /// A byte inside the second of three records is flipped.
    ///
    /// # Actions
    /// 1. Append three records.
    /// 2. Corrupt the payload of record two.
    /// 3. Replay, then recover.
    ///
    /// # Expected behavior
    /// Replay yields record one and then `ChecksumMismatch`; no corrupt
    /// record is ever returned. `recover()` returns only record one and
    /// truncates the file at the end of it, so a new append lands there.
    #[test]
    fn mid_file_corruption_truncates_tail() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        let second_offset;
        {
            let wal = open_wal(&path);
            wal.append(&record(1, "alpha", Some("one"))).unwrap();
            second_offset = wal.append(&record(2, "beta", Some("two"))).unwrap();
            wal.append(&record(3, "gamma", Some("three"))).unwrap();
        }

        // Past the 4-byte length prefix and into the payload.
        overwrite(&path, second_offset + 6, &[0xAB]);

        let wal = open_wal(&path);
        let items: Vec<_> = wal.replay_iter().unwrap().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &record(1, "alpha", Some("one")));
        assert!(matches!(items[1], Err(WalError::ChecksumMismatch(off)) if off == second_offset));

        let recovered = wal.recover().unwrap();
        assert_eq!(recovered, vec![record(1, "alpha", Some("one"))]);
        assert_eq!(wal.len(), second_offset);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), second_offset);

        wal.append(&record(4, "delta", Some("four"))).unwrap();
        drop(wal);
        let wal = open_wal(&path);
        let seqs: Vec<u64> = collect_iter(&wal).unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 4]);
    }

    #[test]
    fn torn_final_record_is_discarded() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        {
            let wal = open_wal(&path);
            wal.append(&record(1, "a", Some("1"))).unwrap();
            wal.append(&record(2, "b", Some("2"))).unwrap();
        }

        let full = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 3).unwrap();
        drop(f);

        let wal = open_wal(&path);
        let items: Vec<_> = wal.replay_iter().unwrap().collect();
        assert!(matches!(items.last(), Some(Err(WalError::UnexpectedEof(_)))));

        assert_eq!(wal.recover().unwrap(), vec![record(1, "a", Some("1"))]);
    }

    #[test]
    fn huge_length_prefix_stops_replay() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        {
            let wal = open_wal(&path);
            wal.append(&record(1, "a", Some("1"))).unwrap();
        }
        overwrite(&path, RECORDS_START, &0xFFFF_FFFFu32.to_le_bytes());

        let wal = open_wal(&path);
        let items: Vec<_> = wal.replay_iter().unwrap().collect();
        assert!(matches!(items.as_slice(), [Err(WalError::RecordTooLarge(_))]));
        assert!(wal.recover().unwrap().is_empty());
        assert!(wal.is_empty());
    }
}
