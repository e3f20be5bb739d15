//! Basic memtable behavior: versioned puts, tombstones, snapshot reads and
//! ordered range iteration.
//!
//! ## See also
//! - [`tests_frozen`] — freeze semantics
//! - [`tests_recovery`] — rebuilding from the WAL segment

#[cfg(test)]
mod tests {
    use crate::memtable::{Memtable, MemtableError, MemtableGetResult};
    use crate::wal::{SyncPolicy, WalError, wal_file_name};
    use std::ops::Bound;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> Memtable {
        Memtable::open(tmp.path().join(wal_file_name(0)), None, SyncPolicy::EveryWrite).unwrap()
    }

    #[test]
    fn put_get_overwrite() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);

        mt.put(b"a".to_vec(), b"1".to_vec(), 1).unwrap();
        mt.put(b"a".to_vec(), b"2".to_vec(), 2).unwrap();

        assert_eq!(
            mt.get(b"a"),
            MemtableGetResult::Put {
                value: b"2".to_vec(),
                seq: 2
            }
        );
        assert_eq!(mt.get(b"missing"), MemtableGetResult::NotFound);
        assert_eq!(mt.len(), 2);
        assert_eq!(mt.max_seq(), 2);
    }

    #[test]
    fn delete_shadows_put() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);

        mt.put(b"k".to_vec(), b"v".to_vec(), 1).unwrap();
        mt.delete(b"k".to_vec(), 2).unwrap();
        assert_eq!(mt.get(b"k"), MemtableGetResult::Delete { seq: 2 });

        mt.put(b"k".to_vec(), b"again".to_vec(), 3).unwrap();
        assert!(matches!(mt.get(b"k"), MemtableGetResult::Put { seq: 3, .. }));
    }

    #[test]
    fn empty_value_is_not_a_tombstone() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);

        mt.put(b"k".to_vec(), Vec::new(), 1).unwrap();
        assert_eq!(
            mt.get(b"k"),
            MemtableGetResult::Put {
                value: Vec::new(),
                seq: 1
            }
        );
    }

    #[test]
    fn get_at_respects_read_seq() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);

        mt.put(b"k".to_vec(), b"v1".to_vec(), 10).unwrap();
        mt.put(b"k".to_vec(), b"v2".to_vec(), 20).unwrap();
        mt.delete(b"k".to_vec(), 30).unwrap();

        assert_eq!(mt.get_at(b"k", 5), MemtableGetResult::NotFound);
        assert!(matches!(mt.get_at(b"k", 15), MemtableGetResult::Put { seq: 10, .. }));
        assert!(matches!(mt.get_at(b"k", 29), MemtableGetResult::Put { seq: 20, .. }));
        assert_eq!(mt.get_at(b"k", 30), MemtableGetResult::Delete { seq: 30 });
    }

    #[test]
    fn range_orders_key_asc_seq_desc() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);

        mt.put(b"b".to_vec(), b"b1".to_vec(), 1).unwrap();
        mt.put(b"a".to_vec(), b"a1".to_vec(), 2).unwrap();
        mt.put(b"b".to_vec(), b"b2".to_vec(), 3).unwrap();
        mt.delete(b"c".to_vec(), 4).unwrap();

        let all: Vec<(Vec<u8>, u64)> = mt
            .iter_for_flush()
            .into_iter()
            .map(|(k, e)| (k, e.seq))
            .collect();
        assert_eq!(
            all,
            vec![
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 3),
                (b"b".to_vec(), 1),
                (b"c".to_vec(), 4)
            ]
        );

        let bounded = mt.scan(Bound::Included(b"b"), Bound::Excluded(b"c"), u64::MAX);
        assert_eq!(bounded.len(), 2);
        assert!(bounded.iter().all(|(k, _)| k == b"b"));

        // Versions newer than the read sequence are hidden.
        let pinned = mt.scan(Bound::Unbounded, Bound::Unbounded, 2);
        let seqs: Vec<u64> = pinned.iter().map(|(_, e)| e.seq).collect();
        assert_eq!(seqs, vec![2, 1]);
    }

    #[test]
    fn next_generation_uses_following_segment() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);
        mt.put(b"a".to_vec(), b"1".to_vec(), 1).unwrap();

        let next = mt.next_generation().unwrap();
        assert_eq!(next.wal_seq(), mt.wal_seq() + 1);
        assert!(next.is_empty());
        assert_eq!(next.wal_path().parent(), mt.wal_path().parent());
    }

    #[test]
    fn approximate_size_grows() {
        let tmp = TempDir::new().unwrap();
        let mt = open(&tmp);
        assert_eq!(mt.approximate_size(), 0);
        assert!(mt.is_empty());

        mt.put(b"key".to_vec(), vec![0u8; 100], 1).unwrap();
        let after_one = mt.approximate_size();
        assert!(after_one >= 103);

        mt.delete(b"key".to_vec(), 2).unwrap();
        assert!(mt.approximate_size() > after_one);
    }

    #[test]
    fn write_batch_assigns_seqs_and_skips_oversized() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        let mt = Memtable::open(&path, Some(128), SyncPolicy::EveryWrite).unwrap();

        let outcomes = mt
            .write_batch(
                vec![
                    (b"a".to_vec(), Some(b"1".to_vec())),
                    (b"big".to_vec(), Some(vec![0u8; 1000])),
                    (b"b".to_vec(), None),
                    (b"c".to_vec(), Some(Vec::new())),
                ],
                10,
            )
            .unwrap();

        assert_eq!(outcomes[0].as_ref().ok(), Some(&10));
        assert!(matches!(
            outcomes[1],
            Err(MemtableError::Wal(WalError::RecordTooLarge(_)))
        ));
        assert_eq!(outcomes[2].as_ref().ok(), Some(&11));
        assert_eq!(outcomes[3].as_ref().ok(), Some(&12));
        assert_eq!(mt.get(b"big"), MemtableGetResult::NotFound);
        assert_eq!(mt.get(b"b"), MemtableGetResult::Delete { seq: 11 });
        assert_eq!(mt.max_seq(), 12);
        drop(mt);

        let reopened = Memtable::open(&path, Some(128), SyncPolicy::EveryWrite).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.get(b"big"), MemtableGetResult::NotFound);
        assert_eq!(
            reopened.get(b"c"),
            MemtableGetResult::Put {
                value: Vec::new(),
                seq: 12
            }
        );
    }

    #[test]
    fn write_batch_on_frozen_applies_nothing() {
        let tmp = TempDir::new().unwrap();
        let mt = Arc::new(open(&tmp));
        mt.put(b"a".to_vec(), b"1".to_vec(), 1).unwrap();
        let frozen = Arc::clone(&mt).freeze();

        let result = frozen.write_batch(vec![(b"b".to_vec(), Some(b"2".to_vec()))], 2);
        assert!(matches!(result, Err(MemtableError::Frozen)));
        assert_eq!(frozen.get(b"b"), MemtableGetResult::NotFound);
    }
}
