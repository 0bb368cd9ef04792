//! SOPHIA - MemTable (In-Memory Sorted Map)
//! The MemTable is the write-buffer of the LSM-Tree.
//! All writes go here first before being flushed to SSTables on disk.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::types::{Direction, Key, Lookup, Value};

/// Sorted map storing key-value pairs.
/// A `None` value represents a tombstone (deletion marker).
pub type MemMap = BTreeMap<Key, Option<Value>>;

/// In-memory sorted key-value store backed by a BTreeMap.
/// Serves as the write buffer in the LSM-Tree architecture.
///
/// The map sits behind an `Arc` so cursors can hold a snapshot of it;
/// a write while a snapshot is alive copies the map first.
pub struct MemTable {
    entries: Arc<MemMap>,
    /// Current approximate size in bytes.
    size_bytes: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(BTreeMap::new()),
            size_bytes: 0,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Returns the number of entries in the MemTable (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a key-value pair into the MemTable.
    /// If the key already exists, the old value is replaced.
    pub fn insert(&mut self, key: Key, value: Value) {
        let key_len = key.len();
        self.size_bytes += key_len + value.len();
        let previous = Arc::make_mut(&mut self.entries).insert(key, Some(value));
        self.release(key_len, previous);
    }

    /// Delete a key by inserting a tombstone marker.
    pub fn delete(&mut self, key: Key) {
        let key_len = key.len();
        self.size_bytes += key_len;
        let previous = Arc::make_mut(&mut self.entries).insert(key, None);
        self.release(key_len, previous);
    }

    fn release(&mut self, key_len: usize, previous: Option<Option<Value>>) {
        if let Some(old) = previous {
            let old_size = key_len + old.as_ref().map_or(0, |v| v.len());
            self.size_bytes = self.size_bytes.saturating_sub(old_size);
        }
    }

    /// Probe the MemTable for a key.
    pub fn get(&self, key: &[u8]) -> Lookup<&Value> {
        match self.entries.get(key) {
            Some(Some(value)) => Lookup::Found(value),
            Some(None) => Lookup::Deleted,
            None => Lookup::Absent,
        }
    }

    /// Clear all entries from the MemTable and reset size.
    /// Outstanding snapshots keep the old contents.
    pub fn clear(&mut self) {
        self.entries = Arc::new(BTreeMap::new());
        self.size_bytes = 0;
    }

    /// Returns a reference to the inner BTreeMap for iteration.
    pub fn entries(&self) -> &MemMap {
        &self.entries
    }

    /// Cheap point-in-time view of the current contents.
    pub fn snapshot(&self) -> Arc<MemMap> {
        Arc::clone(&self.entries)
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the first entry at or beyond `key` walking in `direction`.
/// With `inclusive == false` the key itself is skipped.
pub fn seek<'a>(
    map: &'a MemMap,
    key: &[u8],
    inclusive: bool,
    direction: Direction,
) -> Option<(&'a Key, &'a Option<Value>)> {
    let pivot = if inclusive {
        Bound::Included(key)
    } else {
        Bound::Excluded(key)
    };
    match direction {
        Direction::Ascending => map.range::<[u8], _>((pivot, Bound::Unbounded)).next(),
        Direction::Descending => map
            .range::<[u8], _>((Bound::Unbounded, pivot))
            .next_back(),
    }
}
