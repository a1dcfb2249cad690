// rust/ptfu-core/src/archive/zip.rs

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use ::zip::result::ZipError;
use ::zip::write::FileOptions;
use ::zip::{CompressionMethod, ZipArchive};

use super::location::{Location, SourceStream};
use super::{not_found, ArchiveSource, ArchiveWriter, Member, SourceHandle};
use crate::config::StorageConfig;
use crate::error::{DatasetError, Result};
use crate::record::Record;

/// Zip archives, on disk or in memory.
#[derive(Debug, Clone)]
pub struct ZipSource {
    location: Location,
    storage: StorageConfig,
}

impl ZipSource {
    pub fn new(location: Location, storage: StorageConfig) -> Self {
        Self { location, storage }
    }

    fn archive(&self) -> Result<ZipArchive<Box<dyn SourceStream>>> {
        let stream = self.location.open(&self.storage)?;
        ZipArchive::new(stream).map_err(|e| {
            DatasetError::archive_with_source(self.location.to_string(), "invalid zip archive", e)
        })
    }
}

struct ZipHandle {
    archive: ZipArchive<Box<dyn SourceStream>>,
    location: String,
}

impl SourceHandle for ZipHandle {
    fn raw_member(&mut self, member: &str) -> Result<Member> {
        let mut file = match self.archive.by_name(member) {
            Ok(file) if !file.is_dir() => file,
            Ok(_) | Err(ZipError::FileNotFound) => return Err(not_found(member, &self.location)),
            Err(e) => {
                return Err(DatasetError::archive_with_source(
                    self.location.clone(),
                    format!("failed to open member '{member}'"),
                    e,
                ))
            }
        };
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data).map_err(|e| {
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

impl ArchiveSource for ZipSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        Ok(Box::new(ZipHandle {
            archive: self.archive()?,
            location: self.location.to_string(),
        }))
    }

    fn member_names(&self) -> Result<Vec<String>> {
        let mut archive = self.archive()?;
        let mut names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(|e| {
                DatasetError::archive_with_source(
                    self.location.to_string(),
                    "failed to read central directory",
                    e,
                )
            })?;
            if !file.is_dir() {
                names.push(file.name().to_string());
            }
        }
        Ok(names)
    }

    fn cache_key(&self) -> String {
        format!("zip:{}", self.location)
    }

    fn location(&self) -> String {
        self.location.to_string()
    }
}

/// Writes records as deflated zip entries.
///
/// Reopening an existing destination appends to it.
pub struct ZipWriter {
    path: PathBuf,
    writer: Option<::zip::ZipWriter<File>>,
}

impl ZipWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn zip_error(&self, message: &str, e: ZipError) -> DatasetError {
        DatasetError::archive_with_source(self.path.display().to_string(), message, e)
    }
}

impl ArchiveWriter for ZipWriter {
    fn open_dst(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Err(DatasetError::archive(self.destination(), "destination already open"));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DatasetError::storage_with_source(parent, "failed to create parent directories", e)
            })?;
        }

        let exists = fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!exists)
            .open(&self.path)
            .map_err(|e| DatasetError::storage_with_source(&self.path, "failed to open zip", e))?;

        let writer = if exists {
            ::zip::ZipWriter::new_append(file)
                .map_err(|e| self.zip_error("failed to reopen zip for appending", e))?
        } else {
            ::zip::ZipWriter::new(file)
        };
        self.writer = Some(writer);
        Ok(())
    }

    fn close_dst(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let file = writer
            .finish()
            .map_err(|e| self.zip_error("failed to finish zip", e))?;
        file.sync_all()
            .map_err(|e| DatasetError::storage_with_source(&self.path, "failed to sync zip", e))
    }

    fn write_record(&mut self, name: &str, record: &Record) -> Result<()> {
        let member = record.persisted_name(name);
        let data = record.persisted_bytes()?;
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let path = self.path.display().to_string();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DatasetError::archive(path.clone(), "destination is not open"))?;
        writer.start_file(member.as_str(), options).map_err(|e| {
            DatasetError::archive_with_source(path.clone(), format!("failed to add '{member}'"), e)
        })?;
        writer.write_all(&data).map_err(|e| {
            DatasetError::archive_with_source(path, format!("failed to write '{member}'"), e)
        })
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }
}
