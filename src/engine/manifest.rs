//! SOPHIA - Manifest
//! Records which SSTables make up the store, oldest first.
//! Rewritten atomically (temp file + rename) whenever the table set changes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SophiaError};

use super::sstable::sync_dir;

pub const MANIFEST_FILE: &str = "MANIFEST";
const FORMAT_VERSION: u32 = 1;

/// Persistent description of the table set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    /// Id handed to the next SSTable written.
    pub next_table_id: u64,
    /// Live SSTable ids, oldest first. Newer tables shadow older ones.
    pub tables: Vec<u64>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            next_table_id: 1,
            tables: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Reserve an id for a new SSTable.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    /// Load the manifest from `dir`. `Ok(None)` if there is none.
    ///
    /// Format: bincode body followed by its CRC32 (4 bytes LE).
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if data.len() < 4 {
            return Err(SophiaError::Corruption(format!("manifest {:?} too short", path)));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != stored_crc {
            return Err(SophiaError::Corruption(format!(
                "manifest {:?} CRC mismatch",
                path
            )));
        }

        let manifest: Manifest = bincode::deserialize(body)
            .map_err(|e| SophiaError::Corruption(format!("manifest {:?}: {}", path, e)))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(SophiaError::Corruption(format!(
                "manifest {:?} has unsupported format version {}",
                path, manifest.format_version
            )));
        }
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest in `dir`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let mut data =
            bincode::serialize(self).map_err(|e| SophiaError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let path = Self::path(dir);
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        sync_dir(dir);
        Ok(())
    }
}
