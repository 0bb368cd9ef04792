//! SOPHIA - Core Type Definitions
//! Defines fundamental types used across the storage engine.

use std::fmt;
use std::str::FromStr;

use crate::error::SophiaError;

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
/// Using Vec<u8> allows arbitrary binary values.
pub type Value = Vec<u8>;

/// Represents a single mutation in the storage engine.
/// A `None` value indicates a tombstone (deletion marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Option<Value>,
}

impl Entry {
    /// Create a new entry with a value (PUT operation).
    pub fn put(key: Key, value: Value) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// Create a tombstone entry (DELETE operation).
    pub fn delete(key: Key) -> Self {
        Self { key, value: None }
    }

    /// Returns true if this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Outcome of probing a single layer (memtable or one SSTable) for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// The layer knows nothing about the key; consult older layers.
    Absent,
    /// The layer holds a tombstone; older layers must not be consulted.
    Deleted,
    /// The layer holds a live value.
    Found(V),
}

/// How `open` treats the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Create the store if it does not exist yet.
    #[default]
    Create,
    /// Only open an existing store.
    Open,
}

/// Traversal direction of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Comparison operator seeding a cursor relative to its seek key.
///
/// `Gt`, `Gte` and `Eq` walk keys in ascending order; `Lt` and `Lte` walk
/// in descending order starting from the closest qualifying key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Order {
    pub fn direction(self) -> Direction {
        match self {
            Order::Eq | Order::Gt | Order::Gte => Direction::Ascending,
            Order::Lt | Order::Lte => Direction::Descending,
        }
    }

    /// Whether the seek key itself qualifies.
    pub fn inclusive(self) -> bool {
        matches!(self, Order::Eq | Order::Gte | Order::Lte)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Order::Eq => "==",
            Order::Gt => ">",
            Order::Gte => ">=",
            Order::Lt => "<",
            Order::Lte => "<=",
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Order {
    type Err = SophiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" | "=" => Ok(Order::Eq),
            ">" => Ok(Order::Gt),
            ">=" => Ok(Order::Gte),
            "<" => Ok(Order::Lt),
            "<=" => Ok(Order::Lte),
            other => Err(SophiaError::InvalidArgument(format!(
                "unknown cursor operator '{}'",
                other
            ))),
        }
    }
}
