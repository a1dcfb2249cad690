// rust/ptfu-core/src/archive/tar.rs

//! Tar archives, plain or gzip-compressed.
//!
//! Compression is detected from the gzip magic bytes rather than the file
//! name. A handle indexes member offsets once and then reads members by
//! seeking; gzip archives are inflated into memory first so that they can be
//! indexed the same way.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use super::location::{Location, SourceStream};
use super::{not_found, ArchiveSource, ArchiveWriter, Member, MemberVisitor, SourceHandle};
use crate::config::StorageConfig;
use crate::error::{DatasetError, Result};
use crate::record::Record;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_gzip(stream: &mut dyn SourceStream) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let n = stream.read(&mut magic)?;
    stream.seek(SeekFrom::Start(0))?;
    Ok(n == 2 && magic == GZIP_MAGIC)
}

fn entry_name(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    parts.join("/")
}

#[derive(Debug, Clone)]
pub struct TarSource {
    location: Location,
    storage: StorageConfig,
}

impl TarSource {
    pub fn new(location: Location, storage: StorageConfig) -> Self {
        Self { location, storage }
    }

    fn io_error(&self, message: &str, e: io::Error) -> DatasetError {
        DatasetError::archive_with_source(self.location.to_string(), message, e)
    }

    // Sequential reader over the uncompressed tar stream.
    fn tar_stream(&self) -> Result<Box<dyn Read + Send>> {
        let mut stream = self.location.open(&self.storage)?;
        let gz = is_gzip(stream.as_mut()).map_err(|e| self.io_error("failed to read archive", e))?;
        Ok(if gz {
            Box::new(GzDecoder::new(stream))
        } else {
            Box::new(stream)
        })
    }

    fn scan(&self, visit_data: bool, visitor: &mut MemberVisitor<'_>) -> Result<()> {
        let mut archive = ::tar::Archive::new(self.tar_stream()?);
        let entries = archive
            .entries()
            .map_err(|e| self.io_error("invalid tar archive", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| self.io_error("invalid tar entry", e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map(|p| entry_name(&p))
                .map_err(|e| self.io_error("invalid tar entry path", e))?;
            let data = if visit_data {
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut buf)
                    .map_err(|e| self.io_error("failed to read tar entry", e))?;
                Bytes::from(buf)
            } else {
                Bytes::new()
            };
            if !visitor(&name, data)? {
                break;
            }
        }
        Ok(())
    }
}

struct TarHandle {
    stream: Box<dyn SourceStream>,
    // member name -> (data offset, size)
    index: HashMap<String, (u64, u64)>,
    location: String,
}

impl TarHandle {
    fn open(source: &TarSource) -> Result<Self> {
        let mut stream = source.location.open(&source.storage)?;
        let gz = is_gzip(stream.as_mut()).map_err(|e| source.io_error("failed to read archive", e))?;
        if gz {
            let mut inflated = Vec::new();
            GzDecoder::new(stream)
                .read_to_end(&mut inflated)
                .map_err(|e| source.io_error("failed to inflate archive", e))?;
            stream = Box::new(Cursor::new(inflated));
        }

        let mut archive = ::tar::Archive::new(stream);
        let mut index = HashMap::new();
        {
            let entries = archive
                .entries_with_seek()
                .map_err(|e| source.io_error("invalid tar archive", e))?;
            for entry in entries {
                let entry = entry.map_err(|e| source.io_error("invalid tar entry", e))?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let name = entry
                    .path()
                    .map(|p| entry_name(&p))
                    .map_err(|e| source.io_error("invalid tar entry path", e))?;
                index.insert(name, (entry.raw_file_position(), entry.size()));
            }
        }

        Ok(Self {
            stream: archive.into_inner(),
            index,
            location: source.location.to_string(),
        })
    }
}

impl SourceHandle for TarHandle {
    fn raw_member(&mut self, member: &str) -> Result<Member> {
        let &(offset, size) = self
            .index
            .get(member)
            .ok_or_else(|| not_found(member, &self.location))?;
        let mut data = vec![0u8; size as usize];
        self.stream
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.stream.read_exact(&mut data))
            .map_err(|e| {
                DatasetError::archive_with_source(
                    self.location.clone(),
                    format!("failed to read member '{member}'"),
                    e,
                )
            })?;
        Ok(Member::raw(data))
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

impl ArchiveSource for TarSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        Ok(Box::new(TarHandle::open(self)?))
    }

    fn member_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.scan(false, &mut |name, _| {
            names.push(name.to_string());
            Ok(true)
        })?;
        Ok(names)
    }

    fn supports_disk_cache(&self) -> bool {
        true
    }

    fn for_each_member(&self, visitor: &mut MemberVisitor<'_>) -> Result<()> {
        self.scan(true, visitor)
    }

    fn cache_key(&self) -> String {
        format!("tar:{}", self.location)
    }

    fn location(&self) -> String {
        self.location.to_string()
    }
}

/// Writes records into a gzip-compressed tar archive.
///
/// A `.tar` destination gets `.gz` appended. The archive is assembled in a
/// temporary file and renamed over the destination on close; reopening an
/// existing destination carries its members over.
pub struct TarWriter {
    path: PathBuf,
    storage: StorageConfig,
    builder: Option<::tar::Builder<GzEncoder<NamedTempFile>>>,
}

impl TarWriter {
    pub fn new(path: impl Into<PathBuf>, storage: &StorageConfig) -> Self {
        let mut path = path.into();
        if path.extension().is_some_and(|ext| ext == "tar") {
            let mut name = path.clone().into_os_string();
            name.push(".gz");
            path = PathBuf::from(name);
        }
        Self {
            path,
            storage: storage.clone(),
            builder: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, message: impl Into<String>, e: io::Error) -> DatasetError {
        DatasetError::archive_with_source(self.path.display().to_string(), message, e)
    }
}

fn append(
    builder: &mut ::tar::Builder<GzEncoder<NamedTempFile>>,
    member: &str,
    data: &[u8],
) -> io::Result<()> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut header = ::tar::Header::new_gnu();
    header.set_entry_type(::tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    builder.append_data(&mut header, member, data)
}

impl ArchiveWriter for TarWriter {
    fn open_dst(&mut self) -> Result<()> {
        if self.builder.is_some() {
            return Err(DatasetError::archive(self.destination(), "destination already open"));
        }
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| {
            DatasetError::storage_with_source(&parent, "failed to create parent directories", e)
        })?;

        let tmp = NamedTempFile::new_in(&parent).map_err(|e| {
            DatasetError::storage_with_source(&parent, "failed to create temporary file", e)
        })?;
        let mut builder = ::tar::Builder::new(GzEncoder::new(tmp, Compression::default()));

        if self.path.is_file() {
            let existing = TarSource::new(Location::path(&self.path), self.storage.clone());
            existing.for_each_member(&mut |name, data| {
                append(&mut builder, name, &data)
                    .map_err(|e| self.io_error(format!("failed to carry over '{name}'"), e))?;
                Ok(true)
            })?;
        }

        self.builder = Some(builder);
        Ok(())
    }

    fn close_dst(&mut self) -> Result<()> {
        let Some(builder) = self.builder.take() else {
            return Ok(());
        };
        let tmp = builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| self.io_error("failed to finish archive", e))?;
        tmp.persist(&self.path).map_err(|e| {
            DatasetError::storage_with_source(&self.path, "failed to persist archive", e.error)
        })?;
        Ok(())
    }

    fn write_record(&mut self, name: &str, record: &Record) -> Result<()> {
        let member = record.persisted_name(name);
        let data = record.persisted_bytes()?;
        let destination = self.destination();
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| DatasetError::archive(destination.clone(), "destination is not open"))?;
        append(builder, &member, &data).map_err(|e| {
            DatasetError::archive_with_source(destination, format!("failed to add '{member}'"), e)
        })
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::record::NdArray;
    use tempfile::TempDir;

    fn plain_tar(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = ::tar::Builder::new(Vec::new());
        for (name, data) in members {
            let mut header = ::tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_plain_tar_in_memory() {
        let bytes = plain_tar(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")]);
        let source = TarSource::new(Location::memory("mem.tar", bytes), StorageConfig::default());

        assert_eq!(source.member_names().unwrap(), vec!["a.txt", "dir/b.txt"]);
        let mut handle = source.open().unwrap();
        match handle.raw_member("dir/b.txt").unwrap() {
            Member::Raw { data, .. } => assert_eq!(data.as_ref(), b"beta"),
            other => panic!("unexpected member {other:?}"),
        }
        assert!(handle.raw_member("c.txt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_writer_appends_gz_suffix() {
        let writer = TarWriter::new("/tmp/out/data.tar", &StorageConfig::default());
        assert_eq!(writer.path(), Path::new("/tmp/out/data.tar.gz"));
        let writer = TarWriter::new("/tmp/out/data.tar.gz", &StorageConfig::default());
        assert_eq!(writer.path(), Path::new("/tmp/out/data.tar.gz"));
    }

    #[test]
    fn test_write_then_read_back_gzip() {
        let dir = TempDir::new().unwrap();
        let storage = StorageConfig::default();
        let mut writer = TarWriter::new(dir.path().join("set.tar"), &storage);
        let records = vec![
            Record::array("x", NdArray::from_vec(vec![1u16, 2, 3])),
            Record::bytes("y.bin", b"yyy".to_vec()),
        ];
        writer.write_by_list(&records).unwrap();

        let path = dir.path().join("set.tar.gz");
        let head = fs::read(&path).unwrap();
        assert_eq!(&head[..2], &GZIP_MAGIC);

        let source = TarSource::new(Location::path(&path), storage);
        assert_eq!(source.member_names().unwrap(), vec!["x.npy", "y.bin"]);
        let mut handle = source.open().unwrap();
        let x = handle
            .find("x", DataType::Npy)
            .unwrap()
            .into_record("x", DataType::Npy)
            .unwrap();
        assert_eq!(x.payload, records[0].payload);
    }

    #[test]
    fn test_reopen_keeps_existing_members() {
        let dir = TempDir::new().unwrap();
        let storage = StorageConfig::default();
        let mut writer = TarWriter::new(dir.path().join("set.tar.gz"), &storage);
        writer.write(&Record::bytes("one", b"1".to_vec()), None).unwrap();
        writer.write(&Record::bytes("two", b"2".to_vec()), None).unwrap();

        let source = TarSource::new(Location::path(writer.path()), storage);
        assert_eq!(source.member_names().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_for_each_member_stops_early() {
        let bytes = plain_tar(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let source = TarSource::new(Location::memory("mem.tar", bytes), StorageConfig::default());
        let mut seen = Vec::new();
        source
            .for_each_member(&mut |name, data| {
                seen.push((name.to_string(), data));
                Ok(seen.len() < 2)
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].1.as_ref(), b"2");
    }
}
