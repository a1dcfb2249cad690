// rust/ptfu-core/src/storetype.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::archive::{
    ArchiveSource, ArchiveWriter, CacheWriter, Cifar10BatchSource, DirSource, DirWriter, Location,
    MemCacheSource, NestedSource, TarSource, TarWriter, TfRecordSource, TfRecordWriter, ZipSource,
    ZipWriter,
};
use crate::cache::MemCache;
use crate::config::StorageConfig;
use crate::error::{DatasetError, Result};

/// Container format of a source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Dir,
    Tar,
    Zip,
    TfRecord,
    MemCache,
    Nested,
    Cifar10Batch,
}

impl StoreType {
    pub const ALL: [StoreType; 7] = [
        StoreType::Dir,
        StoreType::Tar,
        StoreType::Zip,
        StoreType::TfRecord,
        StoreType::MemCache,
        StoreType::Nested,
        StoreType::Cifar10Batch,
    ];

    /// Destination extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            StoreType::Dir => "",
            StoreType::Tar => "tar.gz",
            StoreType::Zip => "zip",
            StoreType::TfRecord => "tfrecord",
            StoreType::MemCache => "",
            StoreType::Nested => "",
            StoreType::Cifar10Batch => "bin",
        }
    }

    pub fn has_writer(self) -> bool {
        matches!(
            self,
            StoreType::Dir
                | StoreType::Tar
                | StoreType::Zip
                | StoreType::TfRecord
                | StoreType::MemCache
        )
    }

    /// Store type for an archive path, from its suffix.
    pub fn from_path(path: impl AsRef<Path>) -> Option<StoreType> {
        let name = path.as_ref().file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar") {
            return Some(StoreType::Tar);
        }
        match name.rsplit_once('.')?.1 {
            "zip" => Some(StoreType::Zip),
            "tfrecord" | "tfrecords" => Some(StoreType::TfRecord),
            "bin" => Some(StoreType::Cifar10Batch),
            _ => None,
        }
    }

    /// Opens a source of this type over `location`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for types that are not backed by a single
    /// location ([`StoreType::Nested`], [`StoreType::MemCache`]) or a directory
    /// given as in-memory bytes.
    pub fn open_source(
        self,
        location: Location,
        storage: &StorageConfig,
    ) -> Result<Arc<dyn ArchiveSource>> {
        let storage = storage.clone();
        Ok(match self {
            StoreType::Dir => match location.as_path() {
                Some(path) => Arc::new(DirSource::new(path)),
                None => {
                    return Err(DatasetError::config(format!(
                        "directory source needs a filesystem path, got '{location}'"
                    )))
                }
            },
            StoreType::Tar => Arc::new(TarSource::new(location, storage)),
            StoreType::Zip => Arc::new(ZipSource::new(location, storage)),
            StoreType::TfRecord => Arc::new(TfRecordSource::new(location, storage)),
            StoreType::Cifar10Batch => Arc::new(Cifar10BatchSource::new(location, storage)),
            StoreType::MemCache | StoreType::Nested => {
                return Err(DatasetError::config(format!(
                    "{self:?} sources are built from a SourceSpec, not a location"
                )))
            }
        })
    }

    /// Creates a writer for a destination of this type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for types without a file writer.
    pub fn create_writer(
        self,
        dst: impl Into<PathBuf>,
        storage: &StorageConfig,
    ) -> Result<Box<dyn ArchiveWriter>> {
        let dst = dst.into();
        Ok(match self {
            StoreType::Dir => Box::new(DirWriter::new(dst)),
            StoreType::Tar => Box::new(TarWriter::new(dst, storage)),
            StoreType::Zip => Box::new(ZipWriter::new(dst)),
            StoreType::TfRecord => Box::new(TfRecordWriter::new(dst, storage)),
            StoreType::MemCache => {
                return Err(DatasetError::config(
                    "memory cache destinations are written through cache_writer",
                ))
            }
            StoreType::Nested | StoreType::Cifar10Batch => {
                return Err(DatasetError::config(format!("{self:?} has no writer")))
            }
        })
    }

    /// Destination path for `name` under `dir`: `<dir>/<name>.<ext>`, or
    /// `<dir>/<name>` when the extension is empty.
    pub fn destination(self, dir: impl AsRef<Path>, name: &str) -> PathBuf {
        let ext = self.extension();
        if ext.is_empty() {
            dir.as_ref().join(name)
        } else {
            dir.as_ref().join(format!("{name}.{ext}"))
        }
    }
}

/// Where a dataset is read from.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// An archive of `store` type at `path`.
    Archive { store: StoreType, path: PathBuf },
    /// Archive `member` of type `inner` stored inside `outer`.
    Nested {
        outer: Box<SourceSpec>,
        inner: StoreType,
        member: String,
    },
    /// Records already held in a memory cache.
    MemCache(Arc<MemCache>),
}

impl SourceSpec {
    pub fn archive(store: StoreType, path: impl Into<PathBuf>) -> Self {
        SourceSpec::Archive {
            store,
            path: path.into(),
        }
    }

    /// An archive whose type is taken from its path suffix (directories
    /// otherwise).
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = StoreType::from_path(&path).unwrap_or(StoreType::Dir);
        SourceSpec::Archive { store, path }
    }

    pub fn nested(outer: SourceSpec, inner: StoreType, member: impl Into<String>) -> Self {
        SourceSpec::Nested {
            outer: Box::new(outer),
            inner,
            member: member.into(),
        }
    }

    pub fn store_type(&self) -> StoreType {
        match self {
            SourceSpec::Archive { store, .. } => *store,
            SourceSpec::Nested { .. } => StoreType::Nested,
            SourceSpec::MemCache(_) => StoreType::MemCache,
        }
    }

    /// Builds the source this spec describes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a nested source is misconfigured.
    pub fn open(&self, storage: &StorageConfig) -> Result<Arc<dyn ArchiveSource>> {
        match self {
            SourceSpec::Archive { store, path } => {
                store.open_source(Location::path(path.clone()), storage)
            }
            SourceSpec::Nested {
                outer,
                inner,
                member,
            } => {
                let outer = outer.open(storage)?;
                Ok(Arc::new(NestedSource::new(
                    outer,
                    *inner,
                    member.clone(),
                    storage.clone(),
                )?))
            }
            SourceSpec::MemCache(cache) => Ok(Arc::new(MemCacheSource::new(Arc::clone(cache)))),
        }
    }
}

/// Writer that fills a memory cache, for [`StoreType::MemCache`] destinations.
pub fn cache_writer(cache: Arc<MemCache>) -> Box<dyn ArchiveWriter> {
    Box::new(CacheWriter::new(cache))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions_and_writers() {
        assert_eq!(StoreType::Tar.extension(), "tar.gz");
        assert_eq!(StoreType::Cifar10Batch.extension(), "bin");
        assert_eq!(StoreType::Dir.extension(), "");

        let with_writer: Vec<_> = StoreType::ALL.into_iter().filter(|s| s.has_writer()).collect();
        assert_eq!(
            with_writer,
            vec![
                StoreType::Dir,
                StoreType::Tar,
                StoreType::Zip,
                StoreType::TfRecord,
                StoreType::MemCache
            ]
        );
    }

    #[test]
    fn test_from_path() {
        assert_eq!(StoreType::from_path("a/b.tar.gz"), Some(StoreType::Tar));
        assert_eq!(StoreType::from_path("b.TAR"), Some(StoreType::Tar));
        assert_eq!(StoreType::from_path("b.zip"), Some(StoreType::Zip));
        assert_eq!(StoreType::from_path("x.tfrecord"), Some(StoreType::TfRecord));
        assert_eq!(StoreType::from_path("data_batch_1.bin"), Some(StoreType::Cifar10Batch));
        assert_eq!(StoreType::from_path("plain"), None);
        assert_eq!(StoreType::from_path("notes.txt"), None);
    }

    #[test]
    fn test_destination_paths() {
        assert_eq!(
            StoreType::Zip.destination("/out", "train-1"),
            PathBuf::from("/out/train-1.zip")
        );
        assert_eq!(StoreType::Dir.destination("/out", "train"), PathBuf::from("/out/train"));
    }

    #[test]
    fn test_unsupported_sources_and_writers() {
        let storage = StorageConfig::default();
        assert!(StoreType::Nested
            .open_source(Location::path("/x"), &storage)
            .is_err());
        assert!(StoreType::Dir
            .open_source(Location::memory("m", Vec::new()), &storage)
            .is_err());
        assert!(StoreType::Cifar10Batch.create_writer("/x", &storage).is_err());
    }

    #[test]
    fn test_source_spec_store_type() {
        let nested = SourceSpec::nested(SourceSpec::from_path("a.tar.gz"), StoreType::Zip, "b.zip");
        assert_eq!(nested.store_type(), StoreType::Nested);
        assert_eq!(SourceSpec::from_path("some/dir").store_type(), StoreType::Dir);
        assert_eq!(
            SourceSpec::MemCache(Arc::new(MemCache::new())).store_type(),
            StoreType::MemCache
        );
    }
}
