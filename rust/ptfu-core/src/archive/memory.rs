// rust/ptfu-core/src/archive/memory.rs

use std::sync::Arc;

use super::{not_found, ArchiveSource, ArchiveWriter, Member, SourceHandle};
use crate::cache::MemCache;
use crate::datatype::DataType;
use crate::error::Result;
use crate::record::Record;

const LOCATION: &str = "memory cache";

/// Reads decoded records straight out of a [`MemCache`].
#[derive(Debug, Clone)]
pub struct MemCacheSource {
    cache: Arc<MemCache>,
}

impl MemCacheSource {
    pub fn new(cache: Arc<MemCache>) -> Self {
        Self { cache }
    }
}

struct MemCacheHandle {
    cache: Arc<MemCache>,
}

impl SourceHandle for MemCacheHandle {
    fn raw_member(&mut self, member: &str) -> Result<Member> {
        let record = self
            .cache
            .read(member)
            .ok_or_else(|| not_found(member, &LOCATION))?;
        Ok(Member::Raw {
            data: record.persisted_bytes()?,
            label: record.label,
        })
    }

    fn find(&mut self, name: &str, datatype: DataType) -> Result<Member> {
        datatype
            .candidates(name)
            .iter()
            .find_map(|candidate| self.cache.read(candidate))
            .map(Member::Record)
            .ok_or_else(|| not_found(name, &LOCATION))
    }

    fn describe(&self) -> String {
        LOCATION.to_string()
    }
}

impl ArchiveSource for MemCacheSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        Ok(Box::new(MemCacheHandle {
            cache: Arc::clone(&self.cache),
        }))
    }

    fn member_names(&self) -> Result<Vec<String>> {
        Ok(self.cache.names())
    }

    fn cache_key(&self) -> String {
        format!("memcache:{:p}", Arc::as_ptr(&self.cache))
    }

    fn location(&self) -> String {
        LOCATION.to_string()
    }
}

/// Writes records into a [`MemCache`], keyed by record name.
#[derive(Debug, Clone)]
pub struct CacheWriter {
    cache: Arc<MemCache>,
}

impl CacheWriter {
    pub fn new(cache: Arc<MemCache>) -> Self {
        Self { cache }
    }
}

impl ArchiveWriter for CacheWriter {
    fn open_dst(&mut self) -> Result<()> {
        Ok(())
    }

    fn close_dst(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_record(&mut self, name: &str, record: &Record) -> Result<()> {
        self.cache.write(name, record.clone());
        Ok(())
    }

    fn destination(&self) -> String {
        LOCATION.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NdArray;

    #[test]
    fn test_writer_then_source() {
        let cache = Arc::new(MemCache::new());
        let mut writer = CacheWriter::new(Arc::clone(&cache));
        let record = Record::array("a", NdArray::from_vec(vec![1i32, 2])).with_label(2);
        writer.write_by_list(&[record.clone()]).unwrap();
        assert_eq!(cache.len(), 1);

        let source = MemCacheSource::new(Arc::clone(&cache));
        assert_eq!(source.member_names().unwrap(), vec!["a"]);

        let mut handle = source.open().unwrap();
        let found = handle
            .find("a", DataType::Npy)
            .unwrap()
            .into_record("renamed", DataType::Npy)
            .unwrap();
        assert_eq!(found.name, "renamed");
        assert_eq!(found.payload, record.payload);
        assert_eq!(found.label, Some(2));

        match handle.raw_member("a").unwrap() {
            Member::Raw { data, label } => {
                assert_eq!(data, record.persisted_bytes().unwrap());
                assert_eq!(label, Some(2));
            }
            other => panic!("unexpected member {other:?}"),
        }
        assert!(handle.find("b", DataType::Npy).unwrap_err().is_not_found());
    }
}
