//! SOPHIA - Write-Ahead Log (WAL)
//! Provides durability by logging all mutations to disk
//! before they are applied to the in-memory MemTable.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

use crate::error::{Result, SophiaError};
use crate::types::Entry;

use super::memtable::MemTable;

/// Operation type for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum OpType {
    Put = 1,
    Delete = 2,
}

/// op + key_len + val_len + header crc
const HEADER_LEN: usize = 1 + 4 + 4 + 4;

/// header + payload crc
const RECORD_OVERHEAD: usize = HEADER_LEN + 4;

/// Write-Ahead Log for crash recovery and durability.
///
/// ## Binary Format (per entry)
/// ```text
/// [op_type: 1][key_len: 4 (LE)][val_len: 4 (LE)][header_crc: 4][key: N][value: M][crc: 4]
/// ```
/// `header_crc` covers the first 9 bytes, so lengths are verified before
/// they are trusted. The trailing CRC covers every byte of the record before it.
pub struct WriteAheadLog {
    /// Path to the WAL file on disk.
    path: PathBuf,
    /// File handle opened for appending.
    file: File,
    /// Length of the file after the last successful append.
    len: u64,
    /// fsync after every append.
    sync: bool,
}

/// Result of replaying a WAL file.
pub struct Recovery {
    pub memtable: MemTable,
    /// Number of records applied.
    pub replayed: usize,
    /// Bytes dropped from the tail because the last record was torn.
    pub truncated_bytes: u64,
}

impl WriteAheadLog {
    /// Open or create a WAL file at the specified path.
    pub fn open(path: PathBuf, sync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            len,
            sync,
        })
    }

    /// Returns the path to the WAL file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Current size of the log in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encode a PUT entry into the binary WAL format.
    fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
        Self::encode(OpType::Put, key, value)
    }

    /// Encode a DELETE entry into the binary WAL format.
    fn encode_delete(key: &[u8]) -> Vec<u8> {
        Self::encode(OpType::Delete, key, &[])
    }

    fn encode(op: OpType, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + key.len() + value.len());
        buf.put_u8(op as u8);
        buf.put_u32_le(key.len() as u32);
        buf.put_u32_le(value.len() as u32);
        let header_crc = crc32fast::hash(&buf);
        buf.put_u32_le(header_crc);
        buf.put_slice(key);
        buf.put_slice(value);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Append a PUT operation to the WAL and flush to disk.
    /// This ensures durability: the write is persisted before
    /// the MemTable is updated in memory.
    pub fn append_put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let encoded = Self::encode_put(key, value);
        self.append(&encoded)
    }

    /// Append a DELETE operation to the WAL and flush to disk.
    pub fn append_delete(&mut self, key: &[u8]) -> Result<()> {
        let encoded = Self::encode_delete(key);
        self.append(&encoded)
    }

    /// Write one record. On failure the file is cut back to its previous
    /// length so a half-written record never reaches the next replay.
    fn append(&mut self, record: &[u8]) -> Result<()> {
        let written = self.file.write_all(record).and_then(|()| {
            if self.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        match written {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = self.file.set_len(self.len) {
                    log::warn!(
                        "WAL rollback to {} bytes failed at {:?}: {}",
                        self.len,
                        self.path,
                        rollback
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Force buffered records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Truncate the WAL file (called after successful flush to SSTable).
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        Ok(())
    }

    /// Replay the WAL at `path` into a fresh MemTable.
    ///
    /// A torn final record (crash mid-append) is dropped and the file cut
    /// back to the last whole record. A damaged header or record with more
    /// data after it cannot be a torn write and is reported as corruption;
    /// the file is left untouched in that case.
    pub fn recover(path: &Path) -> Result<Recovery> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut memtable = MemTable::new();
        let mut replayed = 0;
        let mut offset = 0usize;

        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Decoded::Record(entry, size) => {
                    match entry.value {
                        Some(value) => memtable.insert(entry.key, value),
                        None => memtable.delete(entry.key),
                    }
                    replayed += 1;
                    offset += size;
                }
                Decoded::Torn => break,
                Decoded::Damaged { end, reason } => {
                    if offset + end < data.len() {
                        return Err(SophiaError::Corruption(format!(
                            "WAL {:?} record at offset {}: {}",
                            path, offset, reason
                        )));
                    }
                    break;
                }
            }
        }

        let truncated_bytes = (data.len() - offset) as u64;
        if truncated_bytes > 0 {
            log::warn!(
                "Discarding {} bytes of torn WAL tail in {:?}",
                truncated_bytes,
                path
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        Ok(Recovery {
            memtable,
            replayed,
            truncated_bytes,
        })
    }
}

enum Decoded {
    /// A valid record and its encoded size.
    Record(Entry, usize),
    /// Not enough bytes left for the header, or for the payload a
    /// verified header announces.
    Torn,
    /// Bytes present but failing validation. `end` is where the damaged
    /// part stops; anything beyond it rules out a torn write.
    Damaged { end: usize, reason: String },
}

fn decode_record(data: &[u8]) -> Decoded {
    if data.len() < HEADER_LEN {
        return Decoded::Torn;
    }
    let mut header = &data[..HEADER_LEN];
    let op = header.get_u8();
    let key_len = header.get_u32_le() as usize;
    let val_len = header.get_u32_le() as usize;
    let header_crc = header.get_u32_le();
    if crc32fast::hash(&data[..HEADER_LEN - 4]) != header_crc {
        return Decoded::Damaged {
            end: HEADER_LEN,
            reason: "header CRC mismatch".into(),
        };
    }

    let body_len = HEADER_LEN + key_len + val_len;
    let size = body_len + 4;
    if data.len() < size {
        return Decoded::Torn;
    }
    let stored_crc = (&data[body_len..size]).get_u32_le();
    if crc32fast::hash(&data[..body_len]) != stored_crc {
        return Decoded::Damaged {
            end: size,
            reason: "CRC mismatch".into(),
        };
    }

    let key = data[HEADER_LEN..HEADER_LEN + key_len].to_vec();
    let value = &data[HEADER_LEN + key_len..body_len];
    let entry = match op {
        x if x == OpType::Put as u8 => Entry::put(key, value.to_vec()),
        x if x == OpType::Delete as u8 => Entry::delete(key),
        other => {
            return Decoded::Damaged {
                end: size,
                reason: format!("unknown op type {}", other),
            }
        }
    };
    Decoded::Record(entry, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lookup;

    fn wal_in(dir: &Path) -> PathBuf {
        dir.join("test.wal")
    }

    #[test]
    fn test_append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", b"1").unwrap();
            wal.append_put(b"b", b"2").unwrap();
            wal.append_delete(b"a").unwrap();
            assert!(!wal.is_empty());
        }

        let recovery = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(recovery.replayed, 3);
        assert_eq!(recovery.truncated_bytes, 0);
        assert_eq!(recovery.memtable.get(b"a"), Lookup::Deleted);
        assert_eq!(recovery.memtable.get(b"b"), Lookup::Found(&b"2".to_vec()));
    }

    #[test]
    fn test_recover_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = WriteAheadLog::recover(&wal_in(dir.path())).unwrap();
        assert_eq!(recovery.replayed, 0);
        assert!(recovery.memtable.is_empty());
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"kept", b"yes").unwrap();
            wal.append_put(b"lost", b"partially written").unwrap();
        }
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 5).unwrap();

        let recovery = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(recovery.replayed, 1);
        assert!(recovery.truncated_bytes > 0);
        assert_eq!(recovery.memtable.get(b"kept"), Lookup::Found(&b"yes".to_vec()));
        assert_eq!(recovery.memtable.get(b"lost"), Lookup::Absent);

        // The torn bytes are gone, so appends continue on a clean boundary.
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (RECORD_OVERHEAD + 4 + 3) as u64);
    }

    #[test]
    fn test_corrupt_last_record_treated_as_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", b"1").unwrap();
            wal.append_put(b"b", b"2").unwrap();
        }
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 5; // value byte of the last record
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let recovery = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(recovery.replayed, 1);
        assert_eq!(recovery.memtable.get(b"b"), Lookup::Absent);
    }

    #[test]
    fn test_corrupt_middle_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", b"1").unwrap();
            wal.append_put(b"b", b"2").unwrap();
        }
        let mut data = std::fs::read(&path).unwrap();
        data[HEADER_LEN] ^= 0xFF; // first key byte of the first record
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            WriteAheadLog::recover(&path),
            Err(SophiaError::Corruption(_))
        ));
    }

    #[test]
    fn test_corrupt_length_field_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", b"1").unwrap();
            wal.append_put(b"b", b"2").unwrap();
            wal.append_put(b"c", b"3").unwrap();
        }
        let mut data = std::fs::read(&path).unwrap();
        data[4] ^= 0x10; // high byte of the first record's key length
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            WriteAheadLog::recover(&path),
            Err(SophiaError::Corruption(_))
        ));
        // Nothing was cut away: the acknowledged records are still on disk.
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_torn_header_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", b"1").unwrap();
        }
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[1, 9, 0]); // a header cut off mid-write
        std::fs::write(&path, &data).unwrap();

        let recovery = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(recovery.replayed, 1);
        assert_eq!(recovery.truncated_bytes, 3);
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_in(dir.path());
        let mut wal = WriteAheadLog::open(path.clone(), false).unwrap();
        wal.append_put(b"k", b"v").unwrap();
        wal.truncate().unwrap();
        assert!(wal.is_empty());
        wal.append_put(b"k2", b"v2").unwrap();
        drop(wal);

        let recovery = WriteAheadLog::recover(&path).unwrap();
        assert_eq!(recovery.replayed, 1);
        assert_eq!(recovery.memtable.get(b"k"), Lookup::Absent);
    }
}
