//! Leveled compaction policy.
//!
//! Level 0 collects flushed tables and may overlap; every deeper level is a
//! sorted run of non-overlapping tables whose total size is bounded by
//! `level_base_size * level_size_multiplier^(n-1)`.
//!
//! Selection order:
//!
//! 1. Level 0 holds at least `level0_compaction_trigger` tables: merge all of
//!    them with the overlapping level-1 tables into level 1.
//! 2. Otherwise pick the level `n` (1 ≤ n < bottom) with the highest
//!    `size / target_size(n)` above 1.0, and push its oldest table plus the
//!    overlapping level `n+1` tables into `n+1`.

use std::sync::Arc;

use tracing::debug;

use super::{CompactionStrategy, CompactionTask, is_bottommost};
use crate::engine::version::Version;
use crate::sstable::SSTable;

#[derive(Debug, Clone)]
pub struct LeveledPolicy {
    pub level0_compaction_trigger: usize,
    pub level_base_size: u64,
    pub level_size_multiplier: u64,
}

impl LeveledPolicy {
    /// Size budget of level `n` (n ≥ 1).
    pub fn target_size(&self, n: usize) -> u64 {
        let exp = u32::try_from(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.level_size_multiplier
            .checked_pow(exp)
            .and_then(|m| m.checked_mul(self.level_base_size))
            .unwrap_or(u64::MAX)
    }

    /// Pressure of level `n`; above 1.0 means over budget.
    pub fn score(&self, version: &Version, n: usize) -> f64 {
        version.level_bytes(n) as f64 / self.target_size(n) as f64
    }

    fn pick_level0(&self, version: &Version) -> Option<CompactionTask> {
        let level0 = version.level(0);
        if level0.is_empty() || level0.len() < self.level0_compaction_trigger {
            return None;
        }
        let output_level = 1.min(version.bottom_level());
        if output_level == 0 {
            return None;
        }

        let mut inputs: Vec<Arc<SSTable>> = level0.to_vec();
        let (start, end) = key_span(&inputs)?;
        inputs.extend(version.overlapping(1, &start, &end));

        debug!(level0 = level0.len(), inputs = inputs.len(), "selected level-0 compaction");
        Some(finish_task(version, inputs, output_level))
    }

    fn pick_scored(&self, version: &Version) -> Option<CompactionTask> {
        let bottom = version.bottom_level();
        let (level, score) = (1..bottom)
            .map(|n| (n, self.score(version, n)))
            .filter(|(_, score)| *score > 1.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        // Oldest table: lowest id.
        let victim = version.level(level).iter().min_by_key(|t| t.id())?.clone();
        let mut inputs = vec![Arc::clone(&victim)];
        inputs.extend(version.overlapping(level + 1, victim.min_key(), victim.max_key()));

        debug!(level, score, inputs = inputs.len(), "selected leveled compaction");
        Some(finish_task(version, inputs, level + 1))
    }
}

impl CompactionStrategy for LeveledPolicy {
    fn pick(&self, version: &Version) -> Option<CompactionTask> {
        self.pick_level0(version)
            .or_else(|| self.pick_scored(version))
    }

    fn pick_major(&self, version: &Version) -> Option<CompactionTask> {
        let inputs: Vec<Arc<SSTable>> = version.all_tables().cloned().collect();
        if inputs.is_empty() {
            return None;
        }
        Some(CompactionTask {
            inputs,
            output_level: version.bottom_level(),
            bottommost: true,
        })
    }
}

fn key_span(tables: &[Arc<SSTable>]) -> Option<(Vec<u8>, Vec<u8>)> {
    let start = tables.iter().map(|t| t.min_key()).min()?;
    let end = tables.iter().map(|t| t.max_key()).max()?;
    Some((start.to_vec(), end.to_vec()))
}

fn finish_task(version: &Version, inputs: Vec<Arc<SSTable>>, output_level: usize) -> CompactionTask {
    let bottommost = match key_span(&inputs) {
        Some((start, end)) => is_bottommost(version, output_level, &start, &end),
        None => false,
    };
    CompactionTask {
        inputs,
        output_level,
        bottommost,
    }
}
