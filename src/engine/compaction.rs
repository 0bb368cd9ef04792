//! SOPHIA - Compaction Strategy
//! Implements size-tiered compaction to merge SSTables
//! and reclaim space from tombstoned deletions.
//!
//! ## Size-Tiered Strategy
//! - Group SSTables by size tier (base, base*ratio, base*ratio^2, ...)
//! - When enough neighbouring tables share a tier, merge them into one
//! - Only runs of adjacent tables are merged: the table list is ordered by
//!   age and a newer table must keep shadowing every older one

use std::collections::BTreeMap;
use std::ops::Range;

use crate::types::{Entry, Key, Value};

/// Trait defining a compaction strategy.
pub trait CompactionStrategy {
    /// Select a run of adjacent tables (positions in the oldest-first list)
    /// that should be merged together.
    fn select_compaction(&self, tables: &[TableInfo]) -> Option<Range<usize>>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Metadata about an SSTable file.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Unique SSTable ID.
    pub id: u64,
    /// File size in bytes.
    pub size: u64,
}

/// Size-tiered compaction strategy.
pub struct SizeTieredCompaction {
    /// Number of tables per tier before triggering compaction.
    threshold: usize,
    /// Size multiplier between tiers.
    size_ratio: u64,
    /// Upper bound of tier 0 in bytes.
    base_size: u64,
}

impl SizeTieredCompaction {
    /// * `threshold` - adjacent same-tier tables needed to compact (typically 4)
    /// * `size_ratio` - multiplier between tiers (typically 10)
    /// * `base_size` - upper bound of the smallest tier, usually the memtable limit
    pub fn new(threshold: usize, size_ratio: usize, base_size: u64) -> Self {
        Self {
            threshold: threshold.max(2),
            size_ratio: (size_ratio as u64).max(2),
            base_size: base_size.max(1),
        }
    }

    /// Get the tier level for a given SSTable size.
    fn tier_for_size(&self, size: u64) -> usize {
        let mut tier = 0;
        let mut upper_bound = self.base_size;

        while size > upper_bound {
            tier += 1;
            upper_bound = upper_bound.saturating_mul(self.size_ratio);
        }
        tier
    }
}

impl CompactionStrategy for SizeTieredCompaction {
    fn select_compaction(&self, tables: &[TableInfo]) -> Option<Range<usize>> {
        let mut run_start = 0;
        for idx in 1..=tables.len() {
            let run_ends = idx == tables.len()
                || self.tier_for_size(tables[idx].size) != self.tier_for_size(tables[run_start].size);
            if run_ends {
                if idx - run_start >= self.threshold {
                    return Some(run_start..idx);
                }
                run_start = idx;
            }
        }
        None
    }

    fn name(&self) -> &str {
        "SizeTieredCompaction"
    }
}

/// Merge the entries of several tables into one sorted run.
///
/// `tables` is ordered oldest first, so later tables override earlier ones.
/// Tombstones are dropped only when `drop_tombstones` is set, which is safe
/// when the run includes the oldest table: nothing older remains to shadow.
pub fn merge_tables(tables: Vec<Vec<Entry>>, drop_tombstones: bool) -> Vec<(Key, Option<Value>)> {
    let mut merged = BTreeMap::new();

    for table in tables {
        for entry in table {
            merged.insert(entry.key, entry.value);
        }
    }

    merged
        .into_iter()
        .filter(|(_, value)| !(drop_tombstones && value.is_none()))
        .collect()
}
