// rust/ptfu-core/src/archive/dir.rs

//! Plain directory trees.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::{not_found, ArchiveSource, ArchiveWriter, Member, SourceHandle};
use crate::error::{DatasetError, Result};
use crate::record::Record;

/// Resolves a `/`-separated member name below `root`, refusing to escape it.
fn resolve(root: &Path, member: &str) -> Option<PathBuf> {
    let relative = Path::new(member);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

/// Members are files below the root, named by their `/`-separated relative path.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

struct DirHandle {
    root: PathBuf,
}

impl SourceHandle for DirHandle {
    fn raw_member(&mut self, member: &str) -> Result<Member> {
        let path = resolve(&self.root, member).ok_or_else(|| not_found(member, &self.describe()))?;
        match fs::read(&path) {
            Ok(data) => Ok(Member::raw(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(not_found(member, &self.describe()))
            }
            Err(e) if path.is_dir() => {
                tracing::debug!(member, error = %e, "directory is not a member");
                Err(not_found(member, &self.describe()))
            }
            Err(e) => Err(DatasetError::storage_with_source(
                &path,
                "failed to read member",
                e,
            )),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

impl ArchiveSource for DirSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        if !self.root.is_dir() {
            return Err(DatasetError::storage(&self.root, "not a directory"));
        }
        Ok(Box::new(DirHandle {
            root: self.root.clone(),
        }))
    }

    fn member_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                DatasetError::storage(path, format!("failed to walk directory: {e}"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let name: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect();
            names.push(name.join("/"));
        }
        Ok(names)
    }

    fn cache_key(&self) -> String {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        format!("dir:{}", root.display())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Writes one file per record below a root directory.
pub struct DirWriter {
    root: PathBuf,
}

impl DirWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArchiveWriter for DirWriter {
    fn open_dst(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            DatasetError::storage_with_source(&self.root, "failed to create directory", e)
        })
    }

    fn close_dst(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_record(&mut self, name: &str, record: &Record) -> Result<()> {
        let member = record.persisted_name(name);
        let path = resolve(&self.root, &member)
            .ok_or_else(|| DatasetError::storage(&self.root, format!("invalid member name '{member}'")))?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| {
            DatasetError::storage_with_source(&parent, "failed to create parent directories", e)
        })?;

        let data: Bytes = record.persisted_bytes()?;
        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| {
            DatasetError::storage_with_source(&parent, "failed to create temporary file", e)
        })?;
        tmp.write_all(&data)
            .map_err(|e| DatasetError::storage_with_source(&path, "failed to write member", e))?;
        tmp.persist(&path).map_err(|e| {
            DatasetError::storage_with_source(&path, "failed to persist member", e.error)
        })?;
        Ok(())
    }

    fn destination(&self) -> String {
        self.root.display().to_string()
    }
}
