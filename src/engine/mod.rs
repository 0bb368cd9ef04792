//! SOPHIA - Storage Engine Module
//! Top-level module for the LSM-Tree storage engine components.

pub mod bloom;
pub mod compaction;
pub mod cursor;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod sstable;
pub mod wal;

use std::fs;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, SophiaError};
use crate::types::{Direction, Key, Lookup, OpenMode, Value};

use self::compaction::{merge_tables, CompactionStrategy, SizeTieredCompaction, TableInfo};
use self::cursor::Snapshot;
use self::manifest::Manifest;
use self::memtable::MemTable;
use self::metrics::EngineMetrics;
use self::sstable::{parse_table_id, table_path, SsTable};
use self::wal::WriteAheadLog;

pub const WAL_FILE: &str = "sophia.wal";

/// The core Sophia storage engine.
/// Coordinates the MemTable, WAL, SSTables and manifest to provide a
/// durable, ordered key-value store based on LSM-Tree architecture.
///
/// Not thread-safe on its own; [`crate::Database`] wraps it in a lock.
pub struct Sophia {
    /// In-memory sorted buffer for recent writes.
    memtable: MemTable,
    /// Write-ahead log for crash recovery.
    wal: WriteAheadLog,
    /// Persistent list of live tables.
    manifest: Manifest,
    /// Live tables, oldest first (same order as `manifest.tables`).
    tables: Vec<Arc<SsTable>>,
    compaction: SizeTieredCompaction,
    metrics: Arc<EngineMetrics>,
    /// Engine configuration.
    config: Config,
}

impl Sophia {
    /// Open or create a Sophia storage engine at the configured path.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_metrics(config, Arc::new(EngineMetrics::new()))
    }

    /// Like [`Sophia::open`], recording into caller-provided metrics.
    pub fn open_with_metrics(config: Config, metrics: Arc<EngineMetrics>) -> Result<Self> {
        config.validate()?;
        let dir = config.data_dir.clone();
        let manifest = prepare_store(&dir, config.mode)?;
        remove_orphans(&dir, &manifest)?;

        let tables = manifest
            .tables
            .iter()
            .map(|&id| {
                SsTable::open(table_path(&dir, id), id, config.bloom_false_positive_rate)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let wal_path = dir.join(WAL_FILE);
        let recovery = WriteAheadLog::recover(&wal_path)?;
        let wal = WriteAheadLog::open(wal_path, config.sync_writes)?;
        if recovery.replayed > 0 {
            metrics.record_recovery(recovery.replayed);
        }

        log::info!(
            "Sophia engine opened at {:?} ({} tables, {} WAL records recovered)",
            dir,
            tables.len(),
            recovery.replayed
        );

        let compaction = SizeTieredCompaction::new(
            config.compaction_threshold,
            config.compaction_size_ratio,
            config.memtable_max_size as u64,
        );

        Ok(Self {
            memtable: recovery.memtable,
            wal,
            manifest,
            tables,
            compaction,
            metrics,
            config,
        })
    }

    /// Insert a key-value pair into the storage engine.
    /// The write path: WAL (disk) -> MemTable (memory).
    /// A failed WAL append leaves both the log and the MemTable untouched.
    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        check_len("key", key.len())?;
        check_len("value", value.len())?;

        self.wal.append_put(&key, &value)?;
        self.metrics.record_put(key.len(), value.len());
        self.memtable.insert(key, value);
        self.maybe_flush()
    }

    /// Delete a key from the storage engine.
    /// Fails with `KeyNotFound` if the key holds no live value.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        if !self.is_live(&key) {
            return Err(SophiaError::KeyNotFound);
        }
        self.wal.append_delete(&key)?;
        self.metrics.record_delete();
        self.memtable.delete(key);
        self.maybe_flush()
    }

    /// Most recently committed value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Value> {
        let found = self.lookup(key)?;
        self.metrics.record_get(found.as_ref().map(|v| v.len()));
        found.ok_or(SophiaError::KeyNotFound)
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Value>> {
        match self.memtable.get(key) {
            Lookup::Found(value) => return Ok(Some(value.clone())),
            Lookup::Deleted => return Ok(None),
            Lookup::Absent => {}
        }
        for table in self.tables.iter().rev() {
            match table.get(key)? {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Deleted => return Ok(None),
                Lookup::Absent => {}
            }
        }
        Ok(None)
    }

    /// Whether `key` holds a live value, without reading it from disk.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.metrics.record_exists();
        Ok(self.is_live(key))
    }

    fn is_live(&self, key: &[u8]) -> bool {
        match self.memtable.get(key) {
            Lookup::Found(_) => return true,
            Lookup::Deleted => return false,
            Lookup::Absent => {}
        }
        for table in self.tables.iter().rev() {
            match table.contains(key) {
                Lookup::Found(()) => return true,
                Lookup::Deleted => return false,
                Lookup::Absent => {}
            }
        }
        false
    }

    /// Point-in-time view used by cursors.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.memtable.snapshot(),
            self.tables.iter().rev().cloned().collect(),
        )
    }

    /// All live key-value pairs in ascending key order.
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        let snapshot = self.snapshot();
        let mut out = Vec::new();
        let mut next = snapshot.seek(b"", true, Direction::Ascending)?;
        while let Some((key, value)) = next {
            next = snapshot.seek(&key, false, Direction::Ascending)?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Size-triggered flush after a mutation. The mutation is already in
    /// the WAL, so a failure here is logged and not returned; the MemTable
    /// is kept and the next write, `flush` or `close` tries again.
    fn maybe_flush(&mut self) -> Result<()> {
        if self.memtable.size() >= self.config.memtable_max_size {
            if let Err(err) = self.flush() {
                log::error!("Deferred MemTable flush failed: {}", err);
            }
        }
        Ok(())
    }

    /// Persist the MemTable as a new SSTable and reset the WAL.
    pub fn flush(&mut self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }

        // With no older tables a tombstone shadows nothing.
        let drop_tombstones = self.tables.is_empty();
        let dir = self.config.data_dir.clone();
        let mut manifest = self.manifest.clone();
        let entries: Vec<(&[u8], Option<&[u8]>)> = self
            .memtable
            .entries()
            .iter()
            .filter(|(_, value)| !(drop_tombstones && value.is_none()))
            .map(|(key, value)| (key.as_slice(), value.as_deref()))
            .collect();

        let mut new_table = None;
        if !entries.is_empty() {
            let id = manifest.allocate_id();
            let table = SsTable::write(&dir, id, entries, self.config.bloom_false_positive_rate)?;
            manifest.tables.push(id);
            if let Err(err) = manifest.store(&dir) {
                table.mark_obsolete();
                return Err(err);
            }
            new_table = Some(Arc::new(table));
        }

        let flushed = self.memtable.len();
        self.manifest = manifest;
        if let Some(table) = new_table {
            log::info!(
                "Flushed {} MemTable entries to SSTable {}",
                flushed,
                table.id()
            );
            self.tables.push(table);
        }
        self.memtable.clear();
        self.wal.truncate()?;
        self.metrics.record_flush();

        self.maybe_compact()
    }

    fn maybe_compact(&mut self) -> Result<()> {
        loop {
            let infos: Vec<TableInfo> = self
                .tables
                .iter()
                .map(|t| TableInfo {
                    id: t.id(),
                    size: t.file_size(),
                })
                .collect();
            match self.compaction.select_compaction(&infos) {
                Some(range) => {
                    log::debug!(
                        "{} selected tables {:?}",
                        self.compaction.name(),
                        &infos[range.clone()].iter().map(|t| t.id).collect::<Vec<_>>()
                    );
                    self.compact_range(range)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Flush, then merge every SSTable into one, dropping tombstones.
    pub fn compact(&mut self) -> Result<()> {
        self.flush()?;
        if self.tables.len() > 1 {
            self.compact_range(0..self.tables.len())?;
        }
        Ok(())
    }

    /// Replace the adjacent tables in `range` with their merge.
    fn compact_range(&mut self, range: Range<usize>) -> Result<()> {
        let dir = self.config.data_dir.clone();
        let drop_tombstones = range.start == 0;

        let inputs = self.tables[range.clone()]
            .iter()
            .map(|t| t.read_all())
            .collect::<Result<Vec<_>>>()?;
        let merged = merge_tables(inputs, drop_tombstones);

        let mut manifest = self.manifest.clone();
        let new_table = if merged.is_empty() {
            None
        } else {
            let id = manifest.allocate_id();
            let entries = merged.iter().map(|(k, v)| (k.as_slice(), v.as_deref()));
            Some(Arc::new(SsTable::write(
                &dir,
                id,
                entries,
                self.config.bloom_false_positive_rate,
            )?))
        };

        let mut tables = self.tables.clone();
        let removed: Vec<Arc<SsTable>> = tables
            .splice(range.clone(), new_table.iter().cloned())
            .collect();
        manifest.tables = tables.iter().map(|t| t.id()).collect();

        if let Err(err) = manifest.store(&dir) {
            if let Some(table) = &new_table {
                table.mark_obsolete();
            }
            return Err(err);
        }

        self.manifest = manifest;
        self.tables = tables;
        for table in &removed {
            table.mark_obsolete();
        }
        self.metrics.record_compaction();

        log::info!(
            "Compacted {} SSTables into {} ({} entries)",
            removed.len(),
            new_table.map_or_else(|| "nothing".to_string(), |t| t.id().to_string()),
            merged.len()
        );
        Ok(())
    }

    /// Flush pending writes and release the engine.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.wal.sync()?;
        log::info!("Sophia engine at {:?} closed", self.config.data_dir);
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Approximate MemTable size in bytes.
    pub fn memtable_size(&self) -> usize {
        self.memtable.size()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }
}

fn check_len(what: &str, len: usize) -> Result<()> {
    if len > u32::MAX as usize {
        return Err(SophiaError::InvalidArgument(format!(
            "{} of {} bytes exceeds the {} byte limit",
            what,
            len,
            u32::MAX
        )));
    }
    Ok(())
}

/// Resolve the open mode against what exists at `dir` and return the manifest.
fn prepare_store(dir: &Path, mode: OpenMode) -> Result<Manifest> {
    match fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => return Err(SophiaError::AlreadyExists(dir.to_path_buf())),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => match mode {
            OpenMode::Open => return Err(SophiaError::StoreNotFound(dir.to_path_buf())),
            OpenMode::Create => fs::create_dir_all(dir)?,
        },
        Err(err) => return Err(err.into()),
    }

    match Manifest::load(dir)? {
        Some(manifest) => Ok(manifest),
        None if mode == OpenMode::Open => Err(SophiaError::StoreNotFound(dir.to_path_buf())),
        None => {
            let manifest = Manifest::default();
            manifest.store(dir)?;
            log::info!("Created new store at {:?}", dir);
            Ok(manifest)
        }
    }
}

/// Delete tables and temp files a crash left behind.
fn remove_orphans(dir: &Path, manifest: &Manifest) -> Result<()> {
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let orphan = match parse_table_id(name) {
            Some(id) => !manifest.tables.contains(&id),
            None => name.ends_with(".tmp"),
        };
        if orphan {
            log::warn!("Removing orphaned file {:?}", path);
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn small_config(dir: &Path) -> Config {
        Config::new(dir)
            .with_memtable_max_size(256)
            .with_compaction_threshold(3)
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(Config::new(dir.path())).unwrap();

        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"v".to_vec());
        assert!(engine.exists(b"k").unwrap());

        engine.delete(b"k".to_vec()).unwrap();
        assert!(matches!(engine.get(b"k"), Err(SophiaError::KeyNotFound)));
        assert!(matches!(
            engine.delete(b"k".to_vec()),
            Err(SophiaError::KeyNotFound)
        ));
    }

    #[test]
    fn test_flush_creates_table_and_resets_wal() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(Config::new(dir.path())).unwrap();

        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.table_count(), 1);
        assert_eq!(engine.memtable_size(), 0);
        assert_eq!(fs::metadata(dir.path().join(WAL_FILE)).unwrap().len(), 0);
        assert_eq!(engine.get(b"a").unwrap(), b"1".to_vec());
    }

    #[test]
    fn test_tombstone_shadows_older_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(Config::new(dir.path())).unwrap();

        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.delete(b"a".to_vec()).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.table_count(), 2);
        assert!(!engine.exists(b"a").unwrap());
        assert!(matches!(engine.get(b"a"), Err(SophiaError::KeyNotFound)));
    }

    #[test]
    fn test_automatic_flush_and_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(small_config(dir.path())).unwrap();

        for i in 0..200 {
            let key = format!("key_{:04}", i).into_bytes();
            let value = format!("value_{:04}", i).into_bytes();
            engine.put(key, value).unwrap();
        }

        let flushes = engine.metrics().flushes.load(Ordering::Relaxed);
        assert!(flushes >= 3);
        assert!(engine.metrics().compactions.load(Ordering::Relaxed) > 0);
        assert!((engine.table_count() as u64) < flushes);
        for i in (0..200).step_by(17) {
            let key = format!("key_{:04}", i);
            let value = format!("value_{:04}", i).into_bytes();
            assert_eq!(engine.get(key.as_bytes()).unwrap(), value);
        }
    }

    #[test]
    fn test_full_compaction_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(Config::new(dir.path())).unwrap();

        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.delete(b"a".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.compact().unwrap();

        assert_eq!(engine.table_count(), 1);
        assert_eq!(engine.scan().unwrap(), vec![(b"b".to_vec(), b"2".to_vec())]);
        let sst_files = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".sst")
            })
            .count();
        assert_eq!(sst_files, 1);
    }

    #[test]
    fn test_scan_merges_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(Config::new(dir.path())).unwrap();

        engine.put(b"b".to_vec(), b"old".to_vec()).unwrap();
        engine.put(b"c".to_vec(), b"3".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"b".to_vec(), b"new".to_vec()).unwrap();
        engine.delete(b"c".to_vec()).unwrap();

        assert_eq!(
            engine.scan().unwrap(),
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"new".to_vec()),
            ]
        );
    }

    #[test]
    fn test_open_mode_rules() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            Sophia::open(Config::new(&missing).with_mode(OpenMode::Open)),
            Err(SophiaError::StoreNotFound(_))
        ));

        let file = dir.path().join("plain_file");
        fs::write(&file, b"not a store").unwrap();
        assert!(matches!(
            Sophia::open(Config::new(&file)),
            Err(SophiaError::AlreadyExists(_))
        ));

        let empty_dir = dir.path().join("empty");
        fs::create_dir(&empty_dir).unwrap();
        assert!(matches!(
            Sophia::open(Config::new(&empty_dir).with_mode(OpenMode::Open)),
            Err(SophiaError::StoreNotFound(_))
        ));
    }

    #[test]
    fn test_orphan_tables_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        Sophia::open(Config::new(dir.path())).unwrap().close().unwrap();

        let orphan = table_path(dir.path(), 99);
        fs::write(&orphan, b"leftover").unwrap();
        fs::write(dir.path().join("000100.sst.tmp"), b"partial").unwrap();

        let _engine = Sophia::open(Config::new(dir.path())).unwrap();
        assert!(!orphan.exists());
        assert!(!dir.path().join("000100.sst.tmp").exists());
    }

    #[test]
    fn test_failed_automatic_flush_keeps_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine =
            Sophia::open(Config::new(dir.path()).with_memtable_max_size(16)).unwrap();

        // A directory in place of the first table's temp file makes the flush fail.
        let blocker = table_path(dir.path(), 1).with_extension("sst.tmp");
        fs::create_dir(&blocker).unwrap();

        engine
            .put(b"key".to_vec(), b"a value longer than the limit".to_vec())
            .unwrap();
        assert_eq!(
            engine.get(b"key").unwrap(),
            b"a value longer than the limit".to_vec()
        );
        assert_eq!(engine.table_count(), 0);
        assert!(engine.flush().is_err());
        assert!(engine.exists(b"key").unwrap());

        fs::remove_dir(&blocker).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.table_count(), 1);
        assert_eq!(engine.memtable_size(), 0);
        assert_eq!(
            engine.get(b"key").unwrap(),
            b"a value longer than the limit".to_vec()
        );
    }

    #[test]
    fn test_exists_and_delete_do_not_count_as_gets() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Sophia::open(Config::new(dir.path())).unwrap();

        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert!(engine.exists(b"k").unwrap());
        assert!(!engine.exists(b"missing").unwrap());
        engine.delete(b"k".to_vec()).unwrap();

        let snap = engine.metrics().snapshot();
        assert_eq!(snap.gets, 0);
        assert_eq!(snap.exists, 2);
        assert_eq!(snap.deletes, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Sophia::open(Config::new(dir.path()).with_memtable_max_size(0)),
            Err(SophiaError::Config(_))
        ));
    }
}
