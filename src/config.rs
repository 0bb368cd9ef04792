//! SOPHIA - Engine Configuration
//! Defines tunable parameters for the storage engine.

use std::path::PathBuf;

use crate::error::{Result, SophiaError};
use crate::types::OpenMode;

/// Configuration for the Sophia storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding all store files (MANIFEST, WAL, SSTables).
    pub data_dir: PathBuf,

    /// Whether a missing store may be created.
    pub mode: OpenMode,

    /// Maximum size of the MemTable in bytes before triggering a flush.
    pub memtable_max_size: usize,

    /// Whether to sync WAL writes to disk immediately (fsync).
    pub sync_writes: bool,

    /// Target false positive rate of the per-SSTable bloom filters.
    pub bloom_false_positive_rate: f64,

    /// Number of same-tier SSTables that triggers a compaction.
    pub compaction_threshold: usize,

    /// Size multiplier between compaction tiers.
    pub compaction_size_ratio: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            mode: OpenMode::Create,
            memtable_max_size: 4 * 1024 * 1024, // 4 MB
            sync_writes: true,
            bloom_false_positive_rate: 0.01,
            compaction_threshold: 4,
            compaction_size_ratio: 10,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the maximum MemTable size before flush.
    pub fn with_memtable_max_size(mut self, size: usize) -> Self {
        self.memtable_max_size = size;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }

    /// Set how many tables of one tier accumulate before they are merged.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_compaction_size_ratio(mut self, ratio: usize) -> Self {
        self.compaction_size_ratio = ratio;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.memtable_max_size == 0 {
            return Err(SophiaError::Config("memtable_max_size must be > 0".into()));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(SophiaError::Config(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }
        if self.compaction_threshold < 2 {
            return Err(SophiaError::Config(
                "compaction_threshold must be at least 2".into(),
            ));
        }
        if self.compaction_size_ratio < 2 {
            return Err(SophiaError::Config(
                "compaction_size_ratio must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert_eq!(Config::default().mode, OpenMode::Create);
    }

    #[test]
    fn test_builder() {
        let config = Config::new("/tmp/x")
            .with_mode(OpenMode::Open)
            .with_memtable_max_size(1024)
            .with_sync_writes(false)
            .with_compaction_threshold(3);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.mode, OpenMode::Open);
        assert_eq!(config.memtable_max_size, 1024);
        assert!(!config.sync_writes);
        assert_eq!(config.compaction_threshold, 3);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(Config::default().with_memtable_max_size(0).validate().is_err());
        assert!(Config::default()
            .with_bloom_false_positive_rate(1.5)
            .validate()
            .is_err());
        assert!(Config::default().with_compaction_threshold(1).validate().is_err());
        assert!(Config::default().with_compaction_size_ratio(0).validate().is_err());
    }
}
