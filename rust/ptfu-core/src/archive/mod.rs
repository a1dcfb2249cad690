// rust/ptfu-core/src/archive/mod.rs

//! Archive sources, readers and writers.
//!
//! A source ([`ArchiveSource`]) knows how to open one kind of archive and look
//! members up by name. [`ArchiveReader`] layers caching and parallel bulk
//! reads on top of any source; [`ArchiveWriter`] implementations persist
//! records into a destination archive.

mod cifar10;
mod dir;
mod location;
mod memory;
mod nested;
mod reader;
mod tar;
mod tfrecord;
mod writer;
mod zip;

pub use self::cifar10::Cifar10BatchSource;
pub use self::dir::{DirSource, DirWriter};
pub use self::location::{Location, SourceStream};
pub use self::memory::{CacheWriter, MemCacheSource};
pub use self::nested::NestedSource;
pub use self::reader::{ArchiveReader, ArchiveReaderBuilder};
pub use self::tar::{TarSource, TarWriter};
pub use self::tfrecord::{TfRecordSource, TfRecordWriter};
pub use self::writer::{ArchiveWriter, BatchOutcome};
pub use self::zip::{ZipSource, ZipWriter};

use bytes::Bytes;

use crate::datatype::DataType;
use crate::error::{DatasetError, Result};
use crate::record::Record;

/// A member located in a source.
#[derive(Debug, Clone)]
pub enum Member {
    /// Undecoded bytes, with a label when the archive stores one alongside.
    Raw { data: Bytes, label: Option<i64> },
    /// An already decoded record (memory-cache sources).
    Record(Record),
}

impl Member {
    pub fn raw(data: impl Into<Bytes>) -> Self {
        Member::Raw {
            data: data.into(),
            label: None,
        }
    }

    /// Decodes the member as `datatype` into a record named `name`.
    pub fn into_record(self, name: &str, datatype: DataType) -> Result<Record> {
        match self {
            Member::Raw { data, label } => {
                let mut record = datatype.decoder().decode(name, data)?;
                if record.label.is_none() {
                    record.label = label;
                }
                Ok(record)
            }
            Member::Record(mut record) => {
                record.name = name.to_string();
                Ok(record)
            }
        }
    }
}

/// An open source. Closing is dropping the handle.
///
/// Handles are used by one thread at a time and are never shared.
pub trait SourceHandle: Send {
    /// Raw bytes of the member called exactly `member`.
    ///
    /// Returns [`DatasetError::NotFound`] when there is no such member.
    fn raw_member(&mut self, member: &str) -> Result<Member>;

    /// Resolves `name` for `datatype`: the exact member name, then
    /// `name.<ext>`.
    fn find(&mut self, name: &str, datatype: DataType) -> Result<Member> {
        for candidate in datatype.candidates(name) {
            match self.raw_member(&candidate) {
                Err(e) if e.is_not_found() => continue,
                other => return other,
            }
        }
        Err(DatasetError::not_found(name, self.describe()))
    }

    /// Location used in error messages.
    fn describe(&self) -> String;
}

/// Visitor over `(member name, raw bytes)`; return `false` to stop early.
pub type MemberVisitor<'a> = dyn FnMut(&str, Bytes) -> Result<bool> + 'a;

/// One kind of archive at one location.
pub trait ArchiveSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn SourceHandle>>;

    /// Names of all members, in archive order.
    fn member_names(&self) -> Result<Vec<String>>;

    /// Whether `member` is listed by a reader's namelist for `datatype`.
    fn lists_member(&self, member: &str, datatype: DataType) -> bool {
        datatype.matches(member)
    }

    /// Whether readers should warm a disk cache with this source's members.
    fn supports_disk_cache(&self) -> bool {
        false
    }

    /// Visits every member in archive order.
    fn for_each_member(&self, visitor: &mut MemberVisitor<'_>) -> Result<()> {
        let mut handle = self.open()?;
        for name in self.member_names()? {
            let data = match handle.raw_member(&name)? {
                Member::Raw { data, .. } => data,
                Member::Record(record) => record.persisted_bytes()?,
            };
            if !visitor(&name, data)? {
                break;
            }
        }
        Ok(())
    }

    /// Key identifying this source in a disk cache registry.
    fn cache_key(&self) -> String;

    /// Location used in log and error messages.
    fn location(&self) -> String;
}

fn not_found(member: &str, location: &impl std::fmt::Display) -> DatasetError {
    DatasetError::not_found(member, location.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ArrayData, NdArray};
    use std::collections::HashMap;

    struct MapHandle(HashMap<String, Bytes>);

    impl SourceHandle for MapHandle {
        fn raw_member(&mut self, member: &str) -> Result<Member> {
            self.0
                .get(member)
                .cloned()
                .map(Member::raw)
                .ok_or_else(|| not_found(member, &"map"))
        }

        fn describe(&self) -> String {
            "map".to_string()
        }
    }

    #[test]
    fn test_find_tries_extension() {
        let array = NdArray::from_vec(vec![1u8, 2]);
        let mut members = HashMap::new();
        members.insert("a.npy".to_string(), Bytes::from(array.to_npy().unwrap()));
        members.insert("b".to_string(), Bytes::from_static(b"raw"));
        let mut handle = MapHandle(members);

        let record = handle
            .find("a", DataType::Npy)
            .unwrap()
            .into_record("a", DataType::Npy)
            .unwrap();
        assert_eq!(record.name, "a");
        assert_eq!(record.as_array().unwrap().data(), &ArrayData::U8(vec![1, 2]));

        assert!(handle.find("b", DataType::Other).is_ok());
        let err = handle.find("c", DataType::Npy).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_raw_member_label_carried_into_record() {
        let member = Member::Raw {
            data: Bytes::from_static(b"x"),
            label: Some(9),
        };
        let record = member.into_record("x", DataType::Other).unwrap();
        assert_eq!(record.label, Some(9));
    }
}
