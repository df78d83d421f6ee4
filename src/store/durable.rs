//! Durable tier: one checksummed blob per record on disk.
//!
//! # Layout
//!
//! ```text
//! <dir>/<hex sha256(key)>.rec
//!
//! blob = "PRC1" | crc32(payload) as u32 LE | payload
//! payload = {"key": "User:1", "record": {...}}   (JSON)
//! ```
//!
//! Writes go to a `.tmp` sibling first and are renamed into place. The tier
//! is synchronous: merges run on the cache owner path and never suspend.

use crate::error::{CacheError, CacheResult};
use crate::store::{KeyPattern, RecordStore};
use crate::types::{CacheKey, Record, RecordSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const BLOB_MAGIC: &[u8; 4] = b"PRC1";
const HEADER_LEN: usize = 8;
const RECORD_EXT: &str = "rec";
const TEMP_EXT: &str = "tmp";

/// Durable tier configuration.
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// Directory holding the blobs
    pub path: PathBuf,
    /// fsync each blob before the rename
    pub sync_writes: bool,
}

impl DurableConfig {
    /// Configuration for a directory with default options.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
        }
    }
}

/// Durable tier statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableStats {
    /// Number of `load` calls that reached the disk
    pub loads: u64,
    /// Blobs read
    pub reads: u64,
    /// Blobs written
    pub writes: u64,
    /// Blobs found corrupt
    pub corrupt: u64,
}

/// Result of [`DurableStore::vacuum`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub removed_temp: usize,
    pub removed_corrupt: usize,
    pub kept: usize,
}

#[derive(Serialize, Deserialize)]
struct StoredBlob {
    key: CacheKey,
    record: Record,
}

enum BlobRead {
    Missing,
    Corrupt,
    Found(StoredBlob),
}

/// On-disk record store.
pub struct DurableStore {
    config: DurableConfig,
    loads: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    corrupt: AtomicU64,
}

impl DurableStore {
    /// Open (creating if needed) the store directory.
    pub fn open(config: DurableConfig) -> CacheResult<Self> {
        fs::create_dir_all(&config.path).map_err(|e| {
            CacheError::DurableStore(format!(
                "Failed to create {}: {}",
                config.path.display(),
                e
            ))
        })?;
        debug!(path = %config.path.display(), "Opened durable tier");
        Ok(Self {
            config,
            loads: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            corrupt: AtomicU64::new(0),
        })
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> DurableStats {
        DurableStats {
            loads: self.loads.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Read one record.
    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<Record>> {
        match self.read_blob(&self.blob_path(key))? {
            BlobRead::Found(blob) if &blob.key == key => Ok(Some(blob.record)),
            _ => Ok(None),
        }
    }

    /// Every key currently on disk. Scans the directory.
    pub fn keys(&self) -> CacheResult<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for path in self.blob_files(RECORD_EXT)? {
            if let BlobRead::Found(blob) = self.read_blob(&path)? {
                keys.push(blob.key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Merge and return the full merged records alongside the changed keys.
    ///
    /// The tiered cache writes these merged records into the volatile tier
    /// so it never holds a partial copy of a record the disk has in full.
    pub(crate) fn merge_full(
        &self,
        records: &RecordSet,
    ) -> CacheResult<(HashSet<CacheKey>, RecordSet)> {
        let mut changed = HashSet::new();
        let mut merged = RecordSet::new();

        for (key, incoming) in records.iter() {
            let path = self.blob_path(key);
            let (mut record, existed) = match self.read_blob(&path)? {
                BlobRead::Found(blob) if &blob.key == key => (blob.record, true),
                _ => (Record::new(), false),
            };
            let fields_changed = record.merge_from(incoming);
            let did_change = fields_changed || !existed;
            if did_change {
                self.write_blob(&path, key, &record)?;
                changed.insert(key.clone());
            }
            merged.insert(key.clone(), record);
        }

        Ok((changed, merged))
    }

    /// Remove leftover temp files and corrupt blobs.
    pub fn vacuum(&self) -> CacheResult<VacuumReport> {
        let mut report = VacuumReport::default();

        for path in self.blob_files(TEMP_EXT)? {
            remove_file_if_present(&path)?;
            report.removed_temp += 1;
        }

        for path in self.blob_files(RECORD_EXT)? {
            match self.read_blob(&path)? {
                BlobRead::Corrupt => {
                    remove_file_if_present(&path)?;
                    report.removed_corrupt += 1;
                }
                BlobRead::Found(blob) if self.blob_path(&blob.key) != path => {
                    // Blob stored under a name that does not match its key.
                    remove_file_if_present(&path)?;
                    report.removed_corrupt += 1;
                }
                BlobRead::Found(_) => report.kept += 1,
                BlobRead::Missing => {}
            }
        }

        debug!(?report, "Vacuumed durable tier");
        Ok(report)
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        let digest = Sha256::digest(key.as_str().as_bytes());
        self.config
            .path
            .join(format!("{}.{}", hex::encode(digest), RECORD_EXT))
    }

    fn blob_files(&self, extension: &str) -> CacheResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.config.path).map_err(|e| {
            CacheError::DurableStore(format!(
                "Failed to list {}: {}",
                self.config.path.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn read_blob(&self, path: &Path) -> CacheResult<BlobRead> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BlobRead::Missing),
            Err(e) => {
                return Err(CacheError::DurableStore(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        self.reads.fetch_add(1, Ordering::Relaxed);

        match decode_blob(&bytes) {
            Ok(blob) => Ok(BlobRead::Found(blob)),
            Err(reason) => {
                self.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), %reason, "Ignoring corrupt cache blob");
                Ok(BlobRead::Corrupt)
            }
        }
    }

    fn write_blob(&self, path: &Path, key: &CacheKey, record: &Record) -> CacheResult<()> {
        let bytes = encode_blob(key, record)?;
        let temp_path = path.with_extension(TEMP_EXT);

        let mut file = fs::File::create(&temp_path).map_err(|e| {
            CacheError::DurableStore(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;
        file.write_all(&bytes)?;
        if self.config.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| {
            CacheError::DurableStore(format!("Failed to rename {}: {}", temp_path.display(), e))
        })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl RecordStore for DurableStore {
    fn load(&self, keys: &HashSet<CacheKey>) -> CacheResult<HashMap<CacheKey, Record>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.loads.fetch_add(1, Ordering::Relaxed);

        let mut found = HashMap::new();
        for key in keys {
            if let Some(record) = self.get(key)? {
                found.insert(key.clone(), record);
            }
        }
        Ok(found)
    }

    fn merge(&self, records: &RecordSet) -> CacheResult<HashSet<CacheKey>> {
        self.merge_full(records).map(|(changed, _)| changed)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        remove_file_if_present(&self.blob_path(key))
    }

    fn remove_matching(&self, pattern: &KeyPattern) -> CacheResult<Vec<CacheKey>> {
        let mut removed = Vec::new();
        for key in self.keys()? {
            if pattern.matches(&key) && self.remove(&key)? {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> CacheResult<()> {
        for path in self
            .blob_files(RECORD_EXT)?
            .into_iter()
            .chain(self.blob_files(TEMP_EXT)?)
        {
            remove_file_if_present(&path)?;
        }
        Ok(())
    }

    fn len(&self) -> CacheResult<usize> {
        Ok(self.blob_files(RECORD_EXT)?.len())
    }
}

fn remove_file_if_present(path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::DurableStore(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

fn encode_blob(key: &CacheKey, record: &Record) -> CacheResult<Vec<u8>> {
    let payload = serde_json::to_vec(&StoredBlob {
        key: key.clone(),
        record: record.clone(),
    })?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(BLOB_MAGIC);
    bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode_blob(bytes: &[u8]) -> Result<StoredBlob, String> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != BLOB_MAGIC {
        return Err("bad header".to_string());
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&bytes[4..HEADER_LEN]);
    let payload = &bytes[HEADER_LEN..];
    if crc32fast::hash(payload) != u32::from_le_bytes(checksum) {
        return Err("checksum mismatch".to_string());
    }
    serde_json::from_slice(payload).map_err(|e| e.to_string())
}
