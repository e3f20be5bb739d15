//! Immutable view of the on-disk tree.
//!
//! A [`Version`] lists the live SSTables per level. It is never modified in
//! place: flushes and compactions derive a new `Version` and publish it by
//! swapping an `Arc`, so a reader holding the old one keeps a consistent
//! (and still readable) set of files.
//!
//! Level 0 is ordered newest first and its tables may overlap. Levels 1 and
//! deeper are sorted by `min_key` and never overlap.

use std::sync::Arc;

use crate::manifest::ManifestSstEntry;
use crate::sstable::SSTable;

#[derive(Debug, Clone)]
pub struct Version {
    levels: Vec<Vec<Arc<SSTable>>>,
}

impl Version {
    pub fn new(max_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); max_levels.max(1)],
        }
    }

    /// Assemble a version from tables opened at startup.
    pub fn from_tables(max_levels: usize, tables: Vec<(u32, Arc<SSTable>)>) -> Self {
        let mut version = Self::new(max_levels);
        for (level, table) in tables {
            let level = (level as usize).min(version.levels.len() - 1);
            version.levels[level].push(table);
        }
        version.sort_levels();
        version
    }

    pub fn max_levels(&self) -> usize {
        self.levels.len()
    }

    /// Index of the deepest level.
    pub fn bottom_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn level(&self, n: usize) -> &[Arc<SSTable>] {
        self.levels.get(n).map_or(&[], Vec::as_slice)
    }

    pub fn level_bytes(&self, n: usize) -> u64 {
        self.level(n).iter().map(|t| t.file_size()).sum()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Every table, level by level, in lookup order.
    pub fn all_tables(&self) -> impl Iterator<Item = &Arc<SSTable>> {
        self.levels.iter().flatten()
    }

    /// Manifest entries describing this version.
    pub fn entries(&self) -> Vec<ManifestSstEntry> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, tables)| {
                tables.iter().map(move |t| ManifestSstEntry {
                    id: t.id(),
                    level: level as u32,
                })
            })
            .collect()
    }

    /// Tables that may hold `key`, in the order a point lookup must try
    /// them: all overlapping level-0 tables newest first, then at most one
    /// table per deeper level.
    pub fn candidates_for_key<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a Arc<SSTable>> {
        let level0 = self
            .level(0)
            .iter()
            .filter(move |t| t.min_key() <= key && key <= t.max_key());

        let deeper = self.levels.iter().skip(1).filter_map(move |tables| {
            let idx = tables.partition_point(|t| t.max_key() < key);
            tables.get(idx).filter(|t| t.min_key() <= key)
        });

        level0.chain(deeper)
    }

    /// Tables of level `n` whose key range intersects `[start, end]`.
    pub fn overlapping(&self, n: usize, start: &[u8], end: &[u8]) -> Vec<Arc<SSTable>> {
        self.level(n)
            .iter()
            .filter(|t| t.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Add a freshly flushed table as the newest level-0 table.
    pub fn with_flushed(&self, table: Arc<SSTable>) -> Self {
        let mut next = self.clone();
        next.levels[0].insert(0, table);
        next
    }

    /// Replace the tables in `removed` with `added` at `output_level`.
    pub fn with_compaction(
        &self,
        removed: &[u64],
        added: Vec<Arc<SSTable>>,
        output_level: usize,
    ) -> Self {
        let mut next = self.clone();
        for tables in &mut next.levels {
            tables.retain(|t| !removed.contains(&t.id()));
        }
        let output_level = output_level.min(next.levels.len() - 1);
        next.levels[output_level].extend(added);
        next.sort_levels();
        next
    }

    fn sort_levels(&mut self) {
        let mut levels = self.levels.iter_mut();
        if let Some(level0) = levels.next() {
            level0.sort_by(|a, b| b.max_seq().cmp(&a.max_seq()).then(b.id().cmp(&a.id())));
        }
        for tables in levels {
            tables.sort_by(|a, b| a.min_key().cmp(b.min_key()));
        }
    }
}
