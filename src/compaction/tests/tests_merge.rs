//! Merge semantics: shadowed versions, snapshots, tombstones, output size.
//!
//! Coverage:
//! - Newest version wins across overlapping inputs
//! - Versions still visible at the oldest snapshot survive
//! - Tombstones dropped only at the bottom, below the oldest snapshot and
//!   past the retention window
//! - Output split at `target_file_size` without splitting a key
//! - Failed merge leaves no output files behind

#[cfg(test)]
mod tests {
    use super::super::helpers::*;
    use crate::compaction::{CompactionTask, merge};
    use crate::engine::utils::Record;
    use crate::manifest::Manifest;
    use crate::memtable::current_timestamp;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Manifest) {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sst")).unwrap();
        let manifest = Manifest::open(tmp.path().join("manifest")).unwrap();
        // Keep ids handed out by the manifest clear of the fixture ids.
        for _ in 0..100 {
            manifest.allocate_sst_id().unwrap();
        }
        (tmp, manifest)
    }

    /// # Scenario
    /// Two overlapping tables hold different versions of the same keys.
    ///
    /// # Expected behavior
    /// With no snapshot pinning older data, each key keeps only its newest
    /// version, and inputs are reported as removed.
    #[test]
    fn newest_version_wins() {
        let (tmp, manifest) = setup();
        let sst = tmp.path().join("sst");
        let old = table(&sst, 1, &[put("a", "a1", 1), put("b", "b1", 2)]);
        let new = table(&sst, 2, &[put("a", "a2", 3), put("c", "c2", 4)]);

        let task = CompactionTask {
            inputs: vec![new, old],
            output_level: 1,
            bottommost: true,
        };
        let out = merge(&task, &manifest, &sst, &merge_options(), u64::MAX).unwrap();

        assert_eq!(out.removed, vec![2, 1]);
        assert_eq!(out.output_level, 1);
        assert_eq!(out.dropped_versions, 1);
        assert_eq!(
            dump(&out.added),
            vec![
                ("a".into(), 3, Some("a2".into())),
                ("b".into(), 2, Some("b1".into())),
                ("c".into(), 4, Some("c2".into())),
            ]
        );
        assert!(out.manifest_entries().iter().all(|e| e.level == 1));
    }

    /// # Scenario
    /// `k` has versions 10, 5 and 2; the oldest snapshot reads at seq 6.
    ///
    /// # Expected behavior
    /// Seq 10 (newest) and seq 5 (what the snapshot sees) survive; seq 2 is
    /// hidden from every reader and is dropped.
    #[test]
    fn snapshot_visible_versions_survive() {
        let (tmp, manifest) = setup();
        let sst = tmp.path().join("sst");
        let input = table(&sst, 1, &[put("k", "v10", 10), put("k", "v5", 5), put("k", "v2", 2)]);

        let task = CompactionTask {
            inputs: vec![input],
            output_level: 1,
            bottommost: true,
        };
        let out = merge(&task, &manifest, &sst, &merge_options(), 6).unwrap();

        let seqs: Vec<u64> = dump(&out.added).into_iter().map(|(_, seq, _)| seq).collect();
        assert_eq!(seqs, vec![10, 5]);
    }

    /// # Scenario
    /// A tombstone shadows an older put of the same key.
    ///
    /// # Expected behavior
    /// - bottommost, old, below every snapshot → both vanish;
    /// - not bottommost → tombstone kept, the put it shadows dropped;
    /// - tombstone pinned by a snapshot → tombstone and put both kept.
    #[test]
    fn tombstone_drop_rules() {
        let (tmp, manifest) = setup();
        let sst = tmp.path().join("sst");
        let input = table(&sst, 1, &[del("k", 5), put("k", "v", 3), put("z", "live", 4)]);

        let bottom = CompactionTask {
            inputs: vec![input.clone()],
            output_level: 2,
            bottommost: true,
        };
        let out = merge(&bottom, &manifest, &sst, &merge_options(), u64::MAX).unwrap();
        assert_eq!(dump(&out.added), vec![("z".into(), 4, Some("live".into()))]);
        assert_eq!(out.dropped_tombstones, 1);
        out.discard();

        let middle = CompactionTask {
            bottommost: false,
            ..bottom.clone()
        };
        let out = merge(&middle, &manifest, &sst, &merge_options(), u64::MAX).unwrap();
        assert_eq!(
            dump(&out.added),
            vec![("k".into(), 5, None), ("z".into(), 4, Some("live".into()))]
        );
        out.discard();

        let out = merge(&bottom, &manifest, &sst, &merge_options(), 4).unwrap();
        assert_eq!(
            dump(&out.added),
            vec![
                ("k".into(), 5, None),
                ("k".into(), 3, Some("v".into())),
                ("z".into(), 4, Some("live".into())),
            ]
        );
        out.discard();
    }

    #[test]
    fn young_tombstone_kept_within_retention() {
        let (tmp, manifest) = setup();
        let sst = tmp.path().join("sst");
        let fresh = Record::Delete {
            key: b"k".to_vec(),
            seq: 5,
            timestamp: current_timestamp(),
        };
        let input = table(&sst, 1, &[fresh, put("k", "v", 3)]);

        let task = CompactionTask {
            inputs: vec![input],
            output_level: 1,
            bottommost: true,
        };
        let mut options = merge_options();
        options.tombstone_retention = Duration::from_secs(3600);
        let out = merge(&task, &manifest, &sst, &options, u64::MAX).unwrap();

        assert_eq!(dump(&out.added), vec![("k".into(), 5, None)]);
        assert_eq!(out.dropped_tombstones, 0);
    }

    /// # Scenario
    /// A small target file size forces several outputs.
    ///
    /// # Expected behavior
    /// Outputs are non-overlapping and ordered, each key's versions stay in
    /// one file, and no record is lost.
    #[test]
    fn output_split_at_target_size() {
        let (tmp, manifest) = setup();
        let sst = tmp.path().join("sst");
        let mut records = Vec::new();
        for i in 0..400u64 {
            let key = format!("key{i:04}");
            records.push(put(&key, &"v".repeat(64), 1000 + i));
            records.push(put(&key, &"o".repeat(64), i + 1));
        }
        let input = table(&sst, 1, &records);

        let task = CompactionTask {
            inputs: vec![input],
            output_level: 1,
            bottommost: false,
        };
        let mut options = merge_options();
        options.target_file_size = 8 * 1024;
        // Oldest snapshot at 500 keeps both versions of every key.
        let out = merge(&task, &manifest, &sst, &options, 500).unwrap();

        assert!(out.added.len() > 2, "outputs: {}", out.added.len());
        for pair in out.added.windows(2) {
            assert!(pair[0].max_key() < pair[1].min_key());
        }
        assert_eq!(dump(&out.added).len(), 800);
    }

    #[test]
    fn failed_merge_cleans_up_outputs() {
        let (tmp, manifest) = setup();
        let sst = tmp.path().join("sst");
        let good = table(&sst, 1, &[put("a", "1", 1)]);
        let bad = table(&sst, 2, &[put("b", "2", 2)]);

        // Damage the only data block of the second table.
        let path = sst.join(crate::sstable::sst_file_name(2));
        let mut bytes = fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        drop(bad);
        let bad = std::sync::Arc::new(crate::sstable::SSTable::open(&path, 2).unwrap());

        let task = CompactionTask {
            inputs: vec![good, bad],
            output_level: 1,
            bottommost: true,
        };
        assert!(merge(&task, &manifest, &sst, &merge_options(), u64::MAX).is_err());

        let names: Vec<_> = fs::read_dir(&sst)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
    }
}
