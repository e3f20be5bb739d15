//! Ordered iteration and range scans over a single table.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use super::super::helpers::*;
    use crate::sstable::SstWriterOptions;
    use std::ops::Bound;
    use tempfile::TempDir;

    fn keys(records: &[crate::engine::Record]) -> Vec<(Vec<u8>, u64)> {
        records.iter().map(|r| (r.key().to_vec(), r.seq())).collect()
    }

    /// # Scenario
    /// A full iteration returns every stored version, tombstones included,
    /// in `(key ASC, seq DESC)` order.
    #[test]
    fn iter__returns_all_versions() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let records = vec![
            put(b"a", b"2", 5),
            put(b"a", b"1", 1),
            del(b"b", 4),
            put(b"c", b"", 3),
        ];
        let sst = build(&tmp.path().join("iter.sst"), &records);

        let got = collect(sst.iter());
        assert_eq!(keys(&got), keys(&records));
        assert!(got[2].is_delete());
        assert_eq!(got[3].value(), Some(&b""[..]));
    }

    /// # Scenario
    /// Bounds across many small blocks.
    ///
    /// # Starting environment
    /// 200 keys `k000`..`k199` written with a 64-byte block size.
    ///
    /// # Actions
    /// Scan with inclusive, exclusive and unbounded ends.
    ///
    /// # Expected behavior
    /// Exactly the keys inside each range, in order.
    #[test]
    fn scan__bounds_across_blocks() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let records: Vec<_> = (0..200u64)
            .map(|i| put(format!("k{i:03}").as_bytes(), b"value", i + 1))
            .collect();
        let sst = build_with(
            &tmp.path().join("blocks.sst"),
            &records,
            SstWriterOptions {
                block_size: 64,
                ..SstWriterOptions::default()
            },
        );
        assert!(sst.block_count() > 10);

        let got = collect(sst.scan(Bound::Included(&b"k050"[..]), Bound::Excluded(&b"k060"[..])));
        assert_eq!(got.len(), 10);
        assert_eq!(got[0].key(), b"k050");
        assert_eq!(got[9].key(), b"k059");

        let got = collect(sst.scan(Bound::Excluded(&b"k050"[..]), Bound::Included(&b"k060"[..])));
        assert_eq!(got.len(), 10);
        assert_eq!(got[0].key(), b"k051");
        assert_eq!(got[9].key(), b"k060");

        let got = collect(sst.scan(Bound::Included(&b"k190"[..]), Bound::Unbounded));
        assert_eq!(got.len(), 10);

        let got = collect(sst.scan(Bound::Unbounded, Bound::Excluded(&b"k005"[..])));
        assert_eq!(got.len(), 5);
    }

    /// # Scenario
    /// Ranges that miss the table entirely.
    #[test]
    fn scan__outside_key_range_is_empty() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let sst = build(
            &tmp.path().join("miss.sst"),
            &[put(b"m", b"1", 1), put(b"n", b"1", 2)],
        );

        assert!(collect(sst.scan(Bound::Included(&b"a"[..]), Bound::Excluded(&b"m"[..]))).is_empty());
        assert!(collect(sst.scan(Bound::Excluded(&b"n"[..]), Bound::Unbounded)).is_empty());
        assert!(collect(sst.scan(Bound::Included(&b"x"[..]), Bound::Included(&b"z"[..]))).is_empty());
        assert!(!sst.overlaps(b"a", b"l"));
        assert!(sst.overlaps(b"a", b"m"));
    }

    /// # Scenario
    /// An iterator keeps working after its table is marked obsolete, since
    /// it holds its own reference.
    #[test]
    fn iter__survives_obsolete_mark() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let sst = build(
            &tmp.path().join("obsolete.sst"),
            &[put(b"a", b"1", 1), put(b"b", b"2", 2)],
        );

        let iter = sst.iter();
        sst.mark_obsolete();
        drop(sst);

        assert_eq!(collect(iter).len(), 2);
    }
}
