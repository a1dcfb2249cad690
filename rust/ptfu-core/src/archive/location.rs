// rust/ptfu-core/src/archive/location.rs

//! Where an archive's bytes live, and how to stream them.
//!
//! File-backed archives are read through a buffered reader, or memory-mapped
//! once they exceed the configured threshold. In-memory archives (the inner
//! archive of a nested source) are read through a cursor over shared bytes.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

use crate::config::StorageConfig;
use crate::error::{DatasetError, Result};

/// A readable, seekable byte stream over an archive.
pub trait SourceStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> SourceStream for T {}

#[derive(Clone)]
pub enum Location {
    Path(PathBuf),
    Memory { label: String, data: Bytes },
}

impl Location {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Location::Path(path.into())
    }

    pub fn memory(label: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Location::Memory {
            label: label.into(),
            data: data.into(),
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Location::Path(p) => Some(p),
            Location::Memory { .. } => None,
        }
    }

    /// Opens a stream over the archive bytes.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be opened or mapped.
    pub fn open(&self, storage: &StorageConfig) -> Result<Box<dyn SourceStream>> {
        let path = match self {
            Location::Memory { data, .. } => return Ok(Box::new(Cursor::new(data.clone()))),
            Location::Path(path) => path,
        };

        let file = File::open(path)
            .map_err(|e| DatasetError::storage_with_source(path, "failed to open file", e))?;
        let size = file
            .metadata()
            .map_err(|e| DatasetError::storage_with_source(path, "failed to read file metadata", e))?
            .len();

        if storage.use_mmap && size >= storage.mmap_threshold {
            // SAFETY: The file is opened read-only and the map lives as long
            // as the returned stream.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                DatasetError::storage_with_source(path, "failed to memory-map file", e)
            })?;
            Ok(Box::new(Cursor::new(mmap)))
        } else {
            Ok(Box::new(BufReader::with_capacity(storage.buffer_size, file)))
        }
    }

    /// Reads the whole archive into memory.
    pub fn read_all(&self, storage: &StorageConfig) -> Result<Bytes> {
        if let Location::Memory { data, .. } = self {
            return Ok(data.clone());
        }
        let mut stream = self.open(storage)?;
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|e| self.io_error("failed to read archive", e))?;
        Ok(Bytes::from(buf))
    }

    /// Wraps an I/O error with this location.
    pub fn io_error(&self, message: &str, source: std::io::Error) -> DatasetError {
        match self {
            Location::Path(p) => DatasetError::storage_with_source(p, message, source),
            Location::Memory { label, .. } => {
                DatasetError::archive_with_source(label.clone(), message, source)
            }
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Path(p) => write!(f, "{}", p.display()),
            Location::Memory { label, .. } => write!(f, "{label}"),
        }
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Location::Memory { label, data } => f
                .debug_struct("Memory")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
        }
    }
}
