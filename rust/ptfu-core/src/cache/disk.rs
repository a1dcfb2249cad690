// rust/ptfu-core/src/cache/disk.rs

//! Temporary-directory record cache.
//!
//! Layout under the cache root:
//! - `records/<hash>.rec`: decoded records framed by [`super::entry`]
//! - `members/<hash>.raw`: raw archive members extracted by a warm-up pass
//!
//! Files are written to a temporary file and renamed into place, so readers
//! only ever observe complete entries.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::{NamedTempFile, TempDir};

use super::entry;
use crate::config::CacheConfig;
use crate::error::{DatasetError, Result};
use crate::record::Record;

const RECORDS_DIR: &str = "records";
const MEMBERS_DIR: &str = "members";

pub struct DiskCache {
    root: PathBuf,
    dir: Mutex<Option<TempDir>>,
    compression: String,
    compression_level: i32,
}

impl DiskCache {
    /// Creates an empty cache in a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ptfu-cache-")
            .tempdir()
            .map_err(|e| {
                DatasetError::storage_with_source(
                    std::env::temp_dir(),
                    "failed to create cache directory",
                    e,
                )
            })?;
        let root = dir.path().to_path_buf();
        for sub in [RECORDS_DIR, MEMBERS_DIR] {
            let path = root.join(sub);
            fs::create_dir_all(&path).map_err(|e| {
                DatasetError::storage_with_source(&path, "failed to create cache directory", e)
            })?;
        }

        tracing::debug!(path = %root.display(), "created disk cache");
        Ok(Self {
            root,
            dir: Mutex::new(Some(dir)),
            compression: config.compression.clone(),
            compression_level: config.compression_level,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        self.dir.lock().is_none()
    }

    fn key(name: &str) -> String {
        format!("{:016x}", entry::checksum(name.as_bytes()))
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root
            .join(RECORDS_DIR)
            .join(format!("{}.rec", Self::key(name)))
    }

    fn member_path(&self, member: &str) -> PathBuf {
        self.root
            .join(MEMBERS_DIR)
            .join(format!("{}.raw", Self::key(member)))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(DatasetError::storage(path, "disk cache is closed"));
        }
        let parent = path.parent().unwrap_or(&self.root);
        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| {
            DatasetError::storage_with_source(parent, "failed to create temporary file", e)
        })?;
        tmp.write_all(data)
            .map_err(|e| DatasetError::storage_with_source(path, "failed to write cache entry", e))?;
        tmp.persist(path).map_err(|e| {
            DatasetError::storage_with_source(path, "failed to persist cache entry", e.error)
        })?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DatasetError::storage_with_source(
                path,
                "failed to read cache entry",
                e,
            )),
        }
    }

    /// Stores a decoded record under `name`.
    pub fn write(&self, name: &str, record: &Record) -> Result<()> {
        let body = bincode::serialize(record)
            .map_err(|e| DatasetError::serialization(format!("failed to serialize record: {e}")))?;
        let framed = entry::encode(name, &body, &self.compression, self.compression_level)?;
        self.write_atomic(&self.record_path(name), &framed)
    }

    /// Returns the record stored under `name`, `Ok(None)` on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or corrupted entries.
    pub fn read(&self, name: &str) -> Result<Option<Record>> {
        let Some(data) = Self::read_file(&self.record_path(name))? else {
            return Ok(None);
        };
        let (header, body) = entry::decode(&data)?;
        if header.name != name {
            return Ok(None);
        }
        let record = bincode::deserialize(&body).map_err(|e| {
            DatasetError::serialization(format!("failed to deserialize record: {e}"))
        })?;
        Ok(Some(record))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Stores the raw bytes of an archive member.
    pub fn write_member(&self, member: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.member_path(member), data)
    }

    pub fn read_member(&self, member: &str) -> Result<Option<Bytes>> {
        Ok(Self::read_file(&self.member_path(member))?.map(Bytes::from))
    }

    pub fn contains_member(&self, member: &str) -> bool {
        self.member_path(member).exists()
    }

    /// Deletes the cache directory. Later reads miss, later writes fail.
    pub fn close(&self) -> Result<()> {
        let Some(dir) = self.dir.lock().take() else {
            return Ok(());
        };
        tracing::debug!(path = %self.root.display(), "removing disk cache");
        dir.close().map_err(|e| {
            DatasetError::storage_with_source(&self.root, "failed to remove cache directory", e)
        })
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .field("compression", &self.compression)
            .finish()
    }
}
