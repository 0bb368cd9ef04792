//! SOPHIA - Cursors
//! Ordered iteration over a point-in-time snapshot of the store.
//!
//! A cursor is created with a comparison (`==`, `>`, `>=`, `<`, `<=`) and a
//! seek key. Greater-than orders walk ascending, less-than orders walk
//! descending, and `==` yields at most the one matching entry.
//!
//! Each step re-seeks every layer of the snapshot just past the last key
//! returned and takes the nearest candidate. When several layers hold the
//! same key the newest one wins; tombstones are stepped over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SophiaError};
use crate::types::{Direction, Key, Order, Value};

use super::memtable::{self, MemMap};
use super::metrics::EngineMetrics;
use super::sstable::SsTable;

/// Frozen view of the MemTable and the table set.
///
/// Holding a snapshot keeps replaced SSTable files on disk until it is dropped.
#[derive(Clone)]
pub struct Snapshot {
    memtable: Arc<MemMap>,
    /// Newest first.
    tables: Vec<Arc<SsTable>>,
}

/// Where a candidate key was found.
enum Source<'a> {
    Memtable(&'a Option<Value>),
    Table { table: usize, idx: usize },
}

impl Snapshot {
    pub(crate) fn new(memtable: Arc<MemMap>, tables: Vec<Arc<SsTable>>) -> Self {
        Self { memtable, tables }
    }

    /// First live entry at or beyond `key` walking in `direction`.
    pub fn seek(
        &self,
        key: &[u8],
        inclusive: bool,
        direction: Direction,
    ) -> Result<Option<(Key, Value)>> {
        let mut pivot = key.to_vec();
        let mut inclusive = inclusive;

        loop {
            let mut best: Option<(&[u8], Source<'_>)> = memtable::seek(
                &self.memtable,
                &pivot,
                inclusive,
                direction,
            )
            .map(|(k, v)| (k.as_slice(), Source::Memtable(v)));

            for (table_pos, table) in self.tables.iter().enumerate() {
                let Some(idx) = table.seek(&pivot, inclusive, direction) else {
                    continue;
                };
                let candidate = table.key_at(idx);
                // Strict comparison: on a tie the earlier, newer layer stays.
                let closer = match &best {
                    None => true,
                    Some((current, _)) => match direction {
                        Direction::Ascending => candidate < *current,
                        Direction::Descending => candidate > *current,
                    },
                };
                if closer {
                    best = Some((candidate, Source::Table { table: table_pos, idx }));
                }
            }

            let Some((found, source)) = best else {
                return Ok(None);
            };
            let value = match source {
                Source::Memtable(value) => value.clone(),
                Source::Table { table, idx } => {
                    let table = &self.tables[table];
                    if table.is_tombstone_at(idx) {
                        None
                    } else {
                        table.read_value(idx)?
                    }
                }
            };
            match value {
                Some(value) => return Ok(Some((found.to_vec(), value))),
                None => {
                    pivot = found.to_vec();
                    inclusive = false;
                }
            }
        }
    }
}

#[derive(Debug)]
enum CursorState {
    /// Not yet advanced.
    Created,
    Positioned { key: Key, value: Value },
    Exhausted,
    Closed,
}

/// Lazy ordered iterator returned by [`crate::Database::cursor`].
///
/// Call [`Cursor::advance`] to move to the next entry, then read it with
/// [`Cursor::key`] and [`Cursor::value`]. The cursor also implements
/// [`Iterator`], yielding owned pairs.
///
/// Writes made after the cursor was created are not visible to it. Once the
/// owning database is closed every call fails with `InvalidState`.
pub struct Cursor {
    order: Order,
    seek_key: Key,
    /// Released when the cursor is exhausted or closed.
    snapshot: Option<Snapshot>,
    state: CursorState,
    db_closed: Arc<AtomicBool>,
    metrics: Arc<EngineMetrics>,
    /// Set after the iterator has reported an error.
    fused: bool,
}

impl Cursor {
    pub(crate) fn new(
        snapshot: Snapshot,
        order: Order,
        seek_key: Key,
        db_closed: Arc<AtomicBool>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        metrics.record_cursor();
        Self {
            order,
            seek_key,
            snapshot: Some(snapshot),
            state: CursorState::Created,
            db_closed,
            metrics,
            fused: false,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn seek_key(&self) -> &[u8] {
        &self.seek_key
    }

    fn check_open(&self) -> Result<()> {
        if matches!(self.state, CursorState::Closed) {
            return Err(SophiaError::InvalidState("cursor is closed".into()));
        }
        if self.db_closed.load(Ordering::Acquire) {
            return Err(SophiaError::closed());
        }
        Ok(())
    }

    /// Move to the next matching entry.
    ///
    /// Returns `Ok(false)` once no entries remain; further calls keep
    /// returning `Ok(false)`.
    pub fn advance(&mut self) -> Result<bool> {
        self.check_open()?;

        let (pivot, inclusive) = match &self.state {
            CursorState::Exhausted | CursorState::Closed => return Ok(false),
            // `==` matches a single key.
            CursorState::Positioned { .. } if self.order == Order::Eq => (None, false),
            CursorState::Positioned { key, .. } => (Some(key.as_slice()), false),
            CursorState::Created => (Some(self.seek_key.as_slice()), self.order.inclusive()),
        };
        let found = match (pivot, &self.snapshot) {
            (Some(pivot), Some(snapshot)) => {
                snapshot.seek(pivot, inclusive, self.order.direction())?
            }
            _ => None,
        };

        match found {
            Some((key, value)) if self.order != Order::Eq || key == self.seek_key => {
                self.metrics.record_cursor_read(value.len());
                self.state = CursorState::Positioned { key, value };
                Ok(true)
            }
            _ => {
                self.state = CursorState::Exhausted;
                self.snapshot = None;
                Ok(false)
            }
        }
    }

    fn current(&self) -> Result<(&Key, &Value)> {
        self.check_open()?;
        match &self.state {
            CursorState::Positioned { key, value } => Ok((key, value)),
            CursorState::Created => Err(SophiaError::InvalidState(
                "cursor has not been advanced".into(),
            )),
            _ => Err(SophiaError::InvalidState("cursor is exhausted".into())),
        }
    }

    /// Key of the current entry.
    pub fn key(&self) -> Result<&[u8]> {
        self.current().map(|(key, _)| key.as_slice())
    }

    /// Value of the current entry.
    pub fn value(&self) -> Result<&[u8]> {
        self.current().map(|(_, value)| value.as_slice())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, CursorState::Closed)
    }

    /// Release the snapshot. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(SophiaError::InvalidState("cursor already closed".into()));
        }
        self.state = CursorState::Closed;
        self.snapshot = None;
        Ok(())
    }
}

impl Iterator for Cursor {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.advance() {
            Ok(true) => match &self.state {
                CursorState::Positioned { key, value } => Some(Ok((key.clone(), value.clone()))),
                _ => None,
            },
            Ok(false) => None,
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("order", &self.order)
            .field("seek_key", &self.seek_key)
            .field("state", &self.state)
            .finish()
    }
}
