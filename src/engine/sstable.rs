//! SOPHIA - SSTable (Sorted String Table)
//! Immutable on-disk data structure for persisting flushed MemTable data.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::{Buf, BufMut};

use crate::error::{Result, SophiaError};
use crate::types::{Direction, Entry, Key, Lookup, Value};

use super::bloom::BloomFilter;

/// "SPH1" little-endian.
pub const SSTABLE_MAGIC: u32 = u32::from_le_bytes(*b"SPH1");

/// [data_len: 8][entry_count: 8][crc: 4][magic: 4]
pub const FOOTER_SIZE: usize = 24;

const FLAG_VALUE: u8 = 1;
const FLAG_TOMBSTONE: u8 = 2;

/// flag + key_len + val_len + crc
const RECORD_OVERHEAD: usize = 1 + 4 + 4 + 4;

/// In-memory index entry pointing at one record in the data section.
#[derive(Debug, Clone)]
struct IndexEntry {
    key: Key,
    offset: u64,
    size: u32,
    tombstone: bool,
}

/// Sorted String Table - immutable on-disk storage.
///
/// ## File Format
/// ```text
/// [record]* [footer]
/// record = [flag: 1][key_len: 4][key][val_len: 4][value][crc32: 4]
/// footer = [data_len: 8][entry_count: 8][crc32 of previous 16 bytes: 4][magic: 4]
/// ```
/// Records are in strictly ascending key order. Tombstones have flag 2
/// and an empty value. All integers are little-endian.
///
/// Opening a table scans the data section once, verifying every record,
/// and keeps only keys and offsets in memory. Values are read on demand.
pub struct SsTable {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    file_size: u64,
    /// Set once compaction has replaced this table; the file is removed on drop.
    obsolete: AtomicBool,
}

/// File name of table `id` inside the store directory.
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", id))
}

/// Parse a table id back out of a file name produced by `table_path`.
pub fn parse_table_id(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(".sst")?.parse().ok()
}

fn encode_record(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let body = value.unwrap_or_default();
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + key.len() + body.len());
    buf.put_u8(if value.is_some() { FLAG_VALUE } else { FLAG_TOMBSTONE });
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

fn encode_footer(data_len: u64, entry_count: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FOOTER_SIZE);
    buf.put_u64_le(data_len);
    buf.put_u64_le(entry_count);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.put_u32_le(SSTABLE_MAGIC);
    buf
}

impl SsTable {
    /// Write `entries` (sorted, unique keys) to a new table file and open it.
    ///
    /// The table is written under a temporary name, fsynced, then renamed,
    /// so a crash never leaves a half-written file under a live table name.
    pub fn write<'a, I>(dir: &Path, id: u64, entries: I, bloom_fpr: f64) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a [u8], Option<&'a [u8]>)>,
    {
        let path = table_path(dir, id);
        let tmp_path = path.with_extension("sst.tmp");

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut data_len = 0u64;
        let mut entry_count = 0u64;
        let mut last_key: Option<&[u8]> = None;

        for (key, value) in entries {
            if last_key.is_some_and(|prev| prev >= key) {
                drop(writer);
                let _ = fs::remove_file(&tmp_path);
                return Err(SophiaError::InvalidArgument(format!(
                    "SSTable {} entries must be in strictly ascending key order",
                    id
                )));
            }
            last_key = Some(key);

            let record = encode_record(key, value);
            writer.write_all(&record)?;
            data_len += record.len() as u64;
            entry_count += 1;
        }

        writer.write_all(&encode_footer(data_len, entry_count))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &path)?;
        sync_dir(dir);

        log::debug!(
            "SSTable {} written: {} entries, {} bytes",
            id,
            entry_count,
            data_len + FOOTER_SIZE as u64
        );

        Self::open(path, id, bloom_fpr)
    }

    /// Open an existing table, validating footer and every record.
    pub fn open(path: PathBuf, id: u64, bloom_fpr: f64) -> Result<Self> {
        let corrupt = |reason: String| SophiaError::Corruption(format!("SSTable {:?}: {}", path, reason));

        let mut file = OpenOptions::new().read(true).open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(corrupt(format!("file too short ({} bytes)", file_size)));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        file.read_exact(&mut footer)?;
        let mut cur = &footer[..];
        let data_len = cur.get_u64_le();
        let entry_count = cur.get_u64_le();
        let stored_crc = cur.get_u32_le();
        let magic = cur.get_u32_le();

        if magic != SSTABLE_MAGIC {
            return Err(corrupt(format!(
                "bad magic: expected {:#x}, got {:#x}",
                SSTABLE_MAGIC, magic
            )));
        }
        if crc32fast::hash(&footer[..16]) != stored_crc {
            return Err(corrupt("footer CRC mismatch".into()));
        }
        if data_len + FOOTER_SIZE as u64 != file_size {
            return Err(corrupt(format!(
                "data length {} does not match file size {}",
                data_len, file_size
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut index: Vec<IndexEntry> = Vec::with_capacity(entry_count as usize);
        let mut reader = BufReader::new(&mut file).take(data_len);
        let mut offset = 0u64;

        while offset < data_len {
            let entry = read_record(&mut reader).map_err(|err| match err {
                SophiaError::Corruption(reason) => corrupt(format!("offset {}: {}", offset, reason)),
                other => other,
            })?;
            let size = (RECORD_OVERHEAD + entry.key.len() + entry.value.as_ref().map_or(0, |v| v.len())) as u32;

            if index.last().is_some_and(|prev| prev.key >= entry.key) {
                return Err(corrupt(format!("keys out of order at offset {}", offset)));
            }
            index.push(IndexEntry {
                tombstone: entry.is_tombstone(),
                key: entry.key,
                offset,
                size,
            });
            offset += size as u64;
        }
        drop(reader);

        if index.len() as u64 != entry_count {
            return Err(corrupt(format!(
                "footer announces {} entries, found {}",
                entry_count,
                index.len()
            )));
        }

        let bloom = BloomFilter::build(
            index.iter().map(|e| e.key.as_slice()),
            index.len(),
            bloom_fpr,
        );

        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            index,
            bloom,
            file_size,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        self.index.first().map(|e| e.key.as_slice())
    }

    pub fn max_key(&self) -> Option<&[u8]> {
        self.index.last().map(|e| e.key.as_slice())
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        let in_range = matches!(
            (self.min_key(), self.max_key()),
            (Some(min), Some(max)) if min <= key && key <= max
        );
        if !in_range || !self.bloom.may_contain(key) {
            return None;
        }
        self.index
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
    }

    /// Whether the table holds `key`, answered from the in-memory index.
    pub fn contains(&self, key: &[u8]) -> Lookup<()> {
        match self.find(key) {
            None => Lookup::Absent,
            Some(idx) if self.index[idx].tombstone => Lookup::Deleted,
            Some(_) => Lookup::Found(()),
        }
    }

    /// Point lookup, reading the value from disk on a hit.
    pub fn get(&self, key: &[u8]) -> Result<Lookup<Value>> {
        match self.find(key) {
            None => Ok(Lookup::Absent),
            Some(idx) if self.index[idx].tombstone => Ok(Lookup::Deleted),
            Some(idx) => match self.read_value(idx)? {
                Some(value) => Ok(Lookup::Found(value)),
                None => Ok(Lookup::Deleted),
            },
        }
    }

    /// Position of the first entry at or beyond `key` walking in `direction`.
    pub fn seek(&self, key: &[u8], inclusive: bool, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Ascending => {
                let idx = if inclusive {
                    self.index.partition_point(|e| e.key.as_slice() < key)
                } else {
                    self.index.partition_point(|e| e.key.as_slice() <= key)
                };
                (idx < self.index.len()).then_some(idx)
            }
            Direction::Descending => {
                let end = if inclusive {
                    self.index.partition_point(|e| e.key.as_slice() <= key)
                } else {
                    self.index.partition_point(|e| e.key.as_slice() < key)
                };
                end.checked_sub(1)
            }
        }
    }

    pub fn key_at(&self, idx: usize) -> &[u8] {
        &self.index[idx].key
    }

    pub fn is_tombstone_at(&self, idx: usize) -> bool {
        self.index[idx].tombstone
    }

    /// Read and re-verify the record at index position `idx`.
    /// Returns `None` for a tombstone.
    pub fn read_value(&self, idx: usize) -> Result<Option<Value>> {
        let entry = &self.index[idx];
        let mut buf = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.lock().map_err(|_| SophiaError::poisoned())?;
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut buf)?;
        }
        let record = read_record(&mut buf.as_slice()).map_err(|err| match err {
            SophiaError::Corruption(reason) => SophiaError::Corruption(format!(
                "SSTable {:?} offset {}: {}",
                self.path, entry.offset, reason
            )),
            other => other,
        })?;
        if record.key != entry.key {
            return Err(SophiaError::Corruption(format!(
                "SSTable {:?} offset {}: key changed on disk",
                self.path, entry.offset
            )));
        }
        Ok(record.value)
    }

    /// Read every entry in key order (used by compaction).
    pub fn read_all(&self) -> Result<Vec<Entry>> {
        let mut file = self.file.lock().map_err(|_| SophiaError::poisoned())?;
        file.seek(SeekFrom::Start(0))?;
        let data_len = self.file_size - FOOTER_SIZE as u64;
        let mut reader = BufReader::new(&mut *file).take(data_len);
        let mut entries = Vec::with_capacity(self.index.len());
        for _ in 0..self.index.len() {
            entries.push(read_record(&mut reader)?);
        }
        Ok(entries)
    }

    /// Schedule the file for deletion once the last reference is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => log::debug!("Removed obsolete SSTable {:?}", self.path),
                Err(err) => log::warn!("Failed to remove obsolete SSTable {:?}: {}", self.path, err),
            }
        }
    }
}

/// Read one record from `reader`, verifying its CRC.
fn read_record<R: Read>(reader: &mut R) -> Result<Entry> {
    let mut hasher = crc32fast::Hasher::new();

    let mut header = [0u8; 5];
    read_exact_or_corrupt(reader, &mut header)?;
    hasher.update(&header);
    let flag = header[0];
    let key_len = (&header[1..]).get_u32_le() as usize;

    let mut key = vec![0u8; key_len];
    read_exact_or_corrupt(reader, &mut key)?;
    hasher.update(&key);

    let mut len_buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut len_buf)?;
    hasher.update(&len_buf);
    let val_len = u32::from_le_bytes(len_buf) as usize;

    let mut value = vec![0u8; val_len];
    read_exact_or_corrupt(reader, &mut value)?;
    hasher.update(&value);

    let mut crc_buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut crc_buf)?;
    if hasher.finalize() != u32::from_le_bytes(crc_buf) {
        return Err(SophiaError::Corruption("record CRC mismatch".into()));
    }

    match flag {
        FLAG_VALUE => Ok(Entry::put(key, value)),
        FLAG_TOMBSTONE if val_len == 0 => Ok(Entry::delete(key)),
        other => Err(SophiaError::Corruption(format!("bad record flag {}", other))),
    }
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            SophiaError::Corruption("record truncated".into())
        } else {
            SophiaError::Io(err)
        }
    })
}

/// Persist a rename by syncing the parent directory where the platform allows it.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(err) = handle.sync_all() {
            log::debug!("Directory sync of {:?} not supported: {}", dir, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> SsTable {
        let entries: Vec<(Vec<u8>, Option<Vec<u8>>)> = vec![
            (b"apple".to_vec(), Some(b"red".to_vec())),
            (b"banana".to_vec(), None),
            (b"cherry".to_vec(), Some(b"dark".to_vec())),
            (b"date".to_vec(), Some(Vec::new())),
        ];
        SsTable::write(
            dir,
            7,
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_deref())),
            0.01,
        )
        .unwrap()
    }

    #[test]
    fn test_write_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample(dir.path());

        assert_eq!(table.id(), 7);
        assert_eq!(table.len(), 4);
        assert_eq!(table.get(b"apple").unwrap(), Lookup::Found(b"red".to_vec()));
        assert_eq!(table.get(b"banana").unwrap(), Lookup::Deleted);
        assert_eq!(table.get(b"date").unwrap(), Lookup::Found(Vec::new()));
        assert_eq!(table.get(b"zzz").unwrap(), Lookup::Absent);
        assert_eq!(table.contains(b"cherry"), Lookup::Found(()));
        assert_eq!(table.min_key(), Some(b"apple".as_slice()));
        assert_eq!(table.max_key(), Some(b"date".as_slice()));
        assert!(table_path(dir.path(), 7).exists());
        assert!(!table_path(dir.path(), 7).with_extension("sst.tmp").exists());
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path()).path().to_path_buf();
        let table = SsTable::open(path, 7, 0.01).unwrap();
        assert_eq!(table.get(b"cherry").unwrap(), Lookup::Found(b"dark".to_vec()));
        assert_eq!(table.read_all().unwrap().len(), 4);
    }

    #[test]
    fn test_seek() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample(dir.path());

        let at = |idx: Option<usize>| idx.map(|i| table.key_at(i).to_vec());
        assert_eq!(at(table.seek(b"apple", false, Direction::Ascending)), Some(b"banana".to_vec()));
        assert_eq!(at(table.seek(b"apple", true, Direction::Ascending)), Some(b"apple".to_vec()));
        assert_eq!(at(table.seek(b"b", true, Direction::Ascending)), Some(b"banana".to_vec()));
        assert_eq!(at(table.seek(b"date", false, Direction::Ascending)), None);
        assert_eq!(at(table.seek(b"cherry", false, Direction::Descending)), Some(b"banana".to_vec()));
        assert_eq!(at(table.seek(b"cherry", true, Direction::Descending)), Some(b"cherry".to_vec()));
        assert_eq!(at(table.seek(b"apple", false, Direction::Descending)), None);
        assert!(table.is_tombstone_at(1));
    }

    #[test]
    fn test_rejects_unsorted_input() {
        let dir = tempfile::tempdir().unwrap();
        let entries = [(b"b".as_slice(), Some(b"1".as_slice())), (b"a".as_slice(), None)];
        assert!(matches!(
            SsTable::write(dir.path(), 1, entries, 0.01),
            Err(SophiaError::InvalidArgument(_))
        ));
        assert!(!table_path(dir.path(), 1).exists());
    }

    #[test]
    fn test_corrupt_record_detected_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path()).path().to_path_buf();

        let mut data = fs::read(&path).unwrap();
        data[6] ^= 0xFF; // inside the first key
        fs::write(&path, &data).unwrap();

        assert!(matches!(
            SsTable::open(path, 7, 0.01),
            Err(SophiaError::Corruption(_))
        ));
    }

    #[test]
    fn test_bad_magic_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path()).path().to_path_buf();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        assert!(matches!(
            SsTable::open(path, 7, 0.01),
            Err(SophiaError::Corruption(_))
        ));
    }

    #[test]
    fn test_obsolete_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample(dir.path());
        let path = table.path().to_path_buf();
        table.mark_obsolete();
        assert!(path.exists());
        drop(table);
        assert!(!path.exists());
    }

    #[test]
    fn test_table_id_parsing() {
        assert_eq!(parse_table_id("000042.sst"), Some(42));
        assert_eq!(parse_table_id("000042.sst.tmp"), None);
        assert_eq!(parse_table_id("MANIFEST"), None);
    }
}
