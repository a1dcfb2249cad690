// rust/ptfu-core/src/archive/cifar10.rs

//! CIFAR-10 binary batches.
//!
//! A batch is a flat run of fixed-size entries (one label byte, then the
//! three colour planes). Members are named by their zero-padded index.

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;

use super::location::{Location, SourceStream};
use super::{not_found, ArchiveSource, Member, MemberVisitor, SourceHandle};
use crate::codec::CIFAR10_ENTRY_SIZE;
use crate::config::StorageConfig;
use crate::datatype::DataType;
use crate::error::{DatasetError, Result};

fn entry_name(index: usize) -> String {
    format!("{index:05}")
}

#[derive(Debug, Clone)]
pub struct Cifar10BatchSource {
    location: Location,
    storage: StorageConfig,
}

impl Cifar10BatchSource {
    pub fn new(location: Location, storage: StorageConfig) -> Self {
        Self { location, storage }
    }

    fn open_stream(&self) -> Result<(Box<dyn SourceStream>, usize)> {
        let mut stream = self.location.open(&self.storage)?;
        let size = stream
            .seek(SeekFrom::End(0))
            .map_err(|e| self.location.io_error("failed to size batch", e))?;
        let size = size as usize;
        if size % CIFAR10_ENTRY_SIZE != 0 {
            return Err(DatasetError::archive(
                self.location.to_string(),
                format!("batch is {size} bytes, not a multiple of {CIFAR10_ENTRY_SIZE}"),
            ));
        }
        Ok((stream, size / CIFAR10_ENTRY_SIZE))
    }
}

struct Cifar10Handle {
    stream: Box<dyn SourceStream>,
    entries: usize,
    location: Location,
}

impl Cifar10Handle {
    fn read_entry(&mut self, index: usize) -> Result<Bytes> {
        let mut entry = vec![0u8; CIFAR10_ENTRY_SIZE];
        self.stream
            .seek(SeekFrom::Start((index * CIFAR10_ENTRY_SIZE) as u64))
            .and_then(|_| self.stream.read_exact(&mut entry))
            .map_err(|e| self.location.io_error("failed to read batch entry", e))?;
        Ok(Bytes::from(entry))
    }
}

impl SourceHandle for Cifar10Handle {
    fn raw_member(&mut self, member: &str) -> Result<Member> {
        let index = member
            .parse::<usize>()
            .ok()
            .filter(|&i| i < self.entries && entry_name(i) == member)
            .ok_or_else(|| not_found(member, &self.location))?;
        Ok(Member::raw(self.read_entry(index)?))
    }

    fn describe(&self) -> String {
        self.location.to_string()
    }
}

impl ArchiveSource for Cifar10BatchSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        let (stream, entries) = self.open_stream()?;
        Ok(Box::new(Cifar10Handle {
            stream,
            entries,
            location: self.location.clone(),
        }))
    }

    fn member_names(&self) -> Result<Vec<String>> {
        let (_, entries) = self.open_stream()?;
        Ok((0..entries).map(entry_name).collect())
    }

    // Every entry is a CIFAR-10 entry, whatever the requested type.
    fn lists_member(&self, _member: &str, _datatype: DataType) -> bool {
        true
    }

    fn for_each_member(&self, visitor: &mut MemberVisitor<'_>) -> Result<()> {
        let (stream, entries) = self.open_stream()?;
        let mut handle = Cifar10Handle {
            stream,
            entries,
            location: self.location.clone(),
        };
        for index in 0..entries {
            let data = handle.read_entry(index)?;
            if !visitor(&entry_name(index), data)? {
                break;
            }
        }
        Ok(())
    }

    fn cache_key(&self) -> String {
        format!("cifar10:{}", self.location)
    }

    fn location(&self) -> String {
        self.location.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(labels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &label in labels {
            let mut entry = vec![label; CIFAR10_ENTRY_SIZE];
            entry[0] = label;
            out.extend(entry);
        }
        out
    }

    #[test]
    fn test_names_and_entries() {
        let source = Cifar10BatchSource::new(
            Location::memory("batch.bin", batch(&[3, 7, 1])),
            StorageConfig::default(),
        );
        assert_eq!(source.member_names().unwrap(), vec!["00000", "00001", "00002"]);
        assert!(source.lists_member("00001", DataType::Cifar10));

        let mut handle = source.open().unwrap();
        let record = handle
            .find("00001", DataType::Cifar10)
            .unwrap()
            .into_record("00001", DataType::Cifar10)
            .unwrap();
        assert_eq!(record.label, Some(7));
        assert_eq!(record.as_array().unwrap().shape(), &[32, 32, 3]);

        assert!(handle.raw_member("00003").unwrap_err().is_not_found());
        assert!(handle.raw_member("1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_truncated_batch_rejected() {
        let mut bytes = batch(&[1]);
        bytes.pop();
        let source = Cifar10BatchSource::new(Location::memory("short", bytes), StorageConfig::default());
        assert!(matches!(source.open(), Err(DatasetError::Archive { .. })));
    }
}
