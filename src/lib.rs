//! SOPHIA - Embedded Ordered Key-Value Store
//!
//! A persistent, ordered key-value store for a single process, built on a
//! Log-Structured Merge-Tree (LSM-Tree).
//!
//! ## Features
//! - **Write-Ahead Log (WAL)**: Every write is logged with a CRC32 before it is acknowledged
//! - **MemTable**: In-memory BTreeMap buffering recent writes
//! - **SSTable**: Immutable sorted files with checksummed records
//! - **Bloom Filter**: Skips tables that cannot hold a key
//! - **Cursors**: Ordered iteration from a seek key with `==`, `>`, `>=`, `<`, `<=`
//! - **Codecs**: Raw, UTF-8 and serde/bincode value encodings
//! - **Compaction**: Size-tiered merging of adjacent tables
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use sophia::{Database, OpenMode};
//!
//! let db = Database::open("./data", OpenMode::Create).unwrap();
//! db.set("one", "ichi").unwrap();
//! assert_eq!(db.get("one").unwrap(), b"ichi".to_vec());
//! db.close().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod types;

pub use codec::{BincodeCodec, Codec, RawCodec, StringCodec};
pub use config::Config;
pub use database::Database;
pub use engine::cursor::Cursor;
pub use error::{Result, SophiaError};
pub use types::{Key, OpenMode, Order, Value};
