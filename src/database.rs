//! SOPHIA - Database Handle
//! Thread-safe, cloneable handle over the storage engine.
//!
//! ## Concurrency Model
//! - **Read operations** (`get`, `exists`, `cursor`, `scan`) acquire a **read lock** (shared)
//! - **Write operations** (`set`, `delete`, `flush`, `compact`, `close`) acquire a **write lock** (exclusive)
//! - Cursors work on a snapshot and hold no lock between calls
//!
//! Closing the handle closes it for every clone and invalidates all open cursors.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{BincodeCodec, Codec, StringCodec};
use crate::config::Config;
use crate::engine::cursor::Cursor;
use crate::engine::metrics::EngineMetrics;
use crate::engine::Sophia;
use crate::error::{Result, SophiaError};
use crate::types::{Key, OpenMode, Order, Value};

/// Handle to an open store.
///
/// ## Example
/// ```no_run
/// use sophia::{Database, OpenMode, Order};
///
/// let db = Database::open("./data", OpenMode::Create).unwrap();
/// db.set("1", "one").unwrap();
/// db.set("2", "two").unwrap();
///
/// for item in db.cursor(Order::Gt, "1").unwrap() {
///     let (key, value) = item.unwrap();
///     println!("{:?} = {:?}", key, value);
/// }
/// db.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<Shared>,
}

struct Shared {
    engine: RwLock<Option<Sophia>>,
    closed: Arc<AtomicBool>,
    metrics: Arc<EngineMetrics>,
    path: PathBuf,
}

impl Database {
    /// Open the store at `path`, creating it if `mode` allows.
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self> {
        Self::open_with(Config::new(path).with_mode(mode))
    }

    /// Open with full control over engine tuning.
    pub fn open_with(config: Config) -> Result<Self> {
        let metrics = Arc::new(EngineMetrics::new());
        let path = config.data_dir.clone();
        let engine = Sophia::open_with_metrics(config, Arc::clone(&metrics))?;
        Ok(Self {
            inner: Arc::new(Shared {
                engine: RwLock::new(Some(engine)),
                closed: Arc::new(AtomicBool::new(false)),
                metrics,
                path,
            }),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&Sophia) -> Result<R>) -> Result<R> {
        let guard = self.inner.engine.read().map_err(|_| SophiaError::poisoned())?;
        let engine = guard.as_ref().ok_or_else(SophiaError::closed)?;
        f(engine)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Sophia) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.engine.write().map_err(|_| SophiaError::poisoned())?;
        let engine = guard.as_mut().ok_or_else(SophiaError::closed)?;
        f(engine)
    }

    /// Store `value` under `key`, replacing any previous value (write lock).
    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let (key, value) = (key.as_ref().to_vec(), value.as_ref().to_vec());
        self.write(|engine| engine.put(key, value))
    }

    /// Fetch the value under `key` (read lock). `KeyNotFound` if absent.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Value> {
        self.read(|engine| engine.get(key.as_ref()))
    }

    /// Remove `key` (write lock). `KeyNotFound` if absent.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref().to_vec();
        self.write(|engine| engine.delete(key))
    }

    /// Check if `key` holds a value (read lock).
    pub fn exists(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.read(|engine| engine.exists(key.as_ref()))
    }

    /// Open a cursor over a snapshot of the store, positioned before the
    /// first entry that compares to `key` as `order` asks.
    pub fn cursor(&self, order: Order, key: impl AsRef<[u8]>) -> Result<Cursor> {
        let snapshot = self.read(|engine| Ok(engine.snapshot()))?;
        Ok(Cursor::new(
            snapshot,
            order,
            key.as_ref().to_vec(),
            Arc::clone(&self.inner.closed),
            Arc::clone(&self.inner.metrics),
        ))
    }

    /// Scan all live key-value pairs in key order (read lock).
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.read(|engine| engine.scan())
    }

    /// Persist the MemTable as an SSTable (write lock).
    pub fn flush(&self) -> Result<()> {
        self.write(|engine| engine.flush())
    }

    /// Merge all SSTables into one (write lock).
    pub fn compact(&self) -> Result<()> {
        self.write(|engine| engine.compact())
    }

    /// Flush and release the store. Every clone of this handle and every
    /// cursor opened from it becomes unusable. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.engine.write().map_err(|_| SophiaError::poisoned())?;
        let engine = guard.take().ok_or_else(SophiaError::closed)?;
        self.inner.closed.store(true, Ordering::Release);
        engine.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of SSTables currently live (read lock).
    pub fn table_count(&self) -> Result<usize> {
        self.read(|engine| Ok(engine.table_count()))
    }

    /// Get MemTable size in bytes (read lock).
    pub fn memtable_size(&self) -> Result<usize> {
        self.read(|engine| Ok(engine.memtable_size()))
    }

    /// Engine counters. Remain readable after close.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    /// Store `value` encoded with `codec`.
    pub fn set_value<T, C: Codec<T>>(&self, key: impl AsRef<[u8]>, value: &T, codec: &C) -> Result<()> {
        let bytes = codec.encode(value)?;
        self.set(key, bytes)
    }

    /// Fetch and decode the value under `key` with `codec`.
    pub fn get_value<T, C: Codec<T>>(&self, key: impl AsRef<[u8]>, codec: &C) -> Result<T> {
        let bytes = self.get(key)?;
        codec.decode(&bytes)
    }

    pub fn set_string(&self, key: impl AsRef<[u8]>, value: &str) -> Result<()> {
        self.set_value(key, &value.to_string(), &StringCodec)
    }

    pub fn get_string(&self, key: impl AsRef<[u8]>) -> Result<String> {
        self.get_value(key, &StringCodec)
    }

    /// Store any serde value with [`BincodeCodec`].
    pub fn set_object<T: Serialize + DeserializeOwned>(&self, key: impl AsRef<[u8]>, value: &T) -> Result<()> {
        self.set_value(key, value, &BincodeCodec)
    }

    pub fn get_object<T: Serialize + DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> Result<T> {
        self.get_value(key, &BincodeCodec)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let engine = match self.engine.get_mut() {
            Ok(engine) => engine.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(engine) = engine {
            self.closed.store(true, Ordering::Release);
            if let Err(err) = engine.close() {
                log::error!("Failed to close store at {:?}: {}", self.path, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .with_memtable_max_size(64 * 1024)
            .with_sync_writes(false);
        let db = Database::open_with(config).unwrap();
        (dir, db)
    }

    #[test]
    fn test_set_get() {
        let (_dir, db) = temp_db();

        db.set("test", "value").unwrap();
        assert_eq!(db.get("test").unwrap(), b"value".to_vec());
        assert!(db.exists("test").unwrap());
        assert!(matches!(db.get("other"), Err(SophiaError::KeyNotFound)));
    }

    #[test]
    fn test_clone_and_share() {
        let (_dir, db) = temp_db();

        let db_clone = db.clone();
        db_clone.set("shared", "data").unwrap();

        // Original handle sees the update
        assert_eq!(db.get("shared").unwrap(), b"data".to_vec());
    }

    #[test]
    fn test_multiple_concurrent_reads() {
        let (_dir, db) = temp_db();
        db.set("key", "value").unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let db = db.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(db.get("key").unwrap(), b"value".to_vec());
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_concurrent_writes() {
        let (_dir, db) = temp_db();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let db = db.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        db.set(format!("t{}_k{}", t, i), format!("v{}", i)).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(db.scan().unwrap().len(), 200);
    }

    #[test]
    fn test_close_affects_all_clones() {
        let (_dir, db) = temp_db();
        db.set("k", "v").unwrap();
        let other = db.clone();

        db.close().unwrap();
        assert!(other.is_closed());
        assert!(matches!(other.get("k"), Err(SophiaError::InvalidState(_))));
        assert!(matches!(other.set("k", "v"), Err(SophiaError::InvalidState(_))));
        assert!(matches!(db.close(), Err(SophiaError::InvalidState(_))));
    }

    #[test]
    fn test_typed_accessors() {
        let (_dir, db) = temp_db();

        db.set_string("greeting", "hello").unwrap();
        assert_eq!(db.get_string("greeting").unwrap(), "hello");

        db.set_object("point", &(3i32, -4i32)).unwrap();
        let point: (i32, i32) = db.get_object("point").unwrap();
        assert_eq!(point, (3, -4));

        // Plain text was not written by the bincode codec.
        assert!(matches!(
            db.get_object::<(i32, i32)>("greeting"),
            Err(SophiaError::Decode(_))
        ));
    }

    #[test]
    fn test_drop_flushes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), OpenMode::Create).unwrap();
            db.set("persist", "me").unwrap();
        }
        let db = Database::open(dir.path(), OpenMode::Open).unwrap();
        assert_eq!(db.table_count().unwrap(), 1);
        assert_eq!(db.get("persist").unwrap(), b"me".to_vec());
    }
}
