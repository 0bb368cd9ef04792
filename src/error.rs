//! SOPHIA - Custom Error Types
//! Defines the error hierarchy for the storage engine and codec layer.

use std::path::PathBuf;

use thiserror::Error;

/// Custom Result type for the Sophia engine.
pub type Result<T> = std::result::Result<T, SophiaError>;

/// Error types for the Sophia storage engine.
#[derive(Error, Debug)]
pub enum SophiaError {
    /// I/O errors from file operations (WAL, SSTable, manifest).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key is absent (never written, or deleted).
    #[error("Key not found")]
    KeyNotFound,

    /// No store exists at the path and the open mode does not allow creating one.
    #[error("Store not found at {0:?}")]
    StoreNotFound(PathBuf),

    /// The path exists but cannot hold a store (e.g. it is a regular file).
    #[error("Path {0:?} already exists and is not a store")]
    AlreadyExists(PathBuf),

    /// On-disk structure failed validation (CRC mismatch, bad magic, malformed record).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Operation on a closed handle or cursor, or cursor read before positioning.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Caller passed something the engine cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The codec cannot represent the value's shape.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Bytes do not match the shape the codec expects.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Internal metadata could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SophiaError {
    /// True for both "key absent" and "store absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, SophiaError::KeyNotFound | SophiaError::StoreNotFound(_))
    }

    pub(crate) fn closed() -> Self {
        SophiaError::InvalidState("database is closed".into())
    }

    pub(crate) fn poisoned() -> Self {
        SophiaError::InvalidState("engine lock poisoned".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(SophiaError::KeyNotFound.is_not_found());
        assert!(SophiaError::StoreNotFound(PathBuf::from("x")).is_not_found());
        assert!(!SophiaError::Corruption("bad".into()).is_not_found());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: SophiaError = io.into();
        assert!(matches!(err, SophiaError::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
