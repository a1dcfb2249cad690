// rust/ptfu-core/src/archive/nested.rs

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::location::Location;
use super::{ArchiveSource, Member, MemberVisitor, SourceHandle};
use crate::config::StorageConfig;
use crate::datatype::DataType;
use crate::error::{DatasetError, Result};
use crate::storetype::StoreType;

/// An archive stored as a member of another archive.
///
/// The inner archive is pulled out of the outer one on first use and kept in
/// memory for the lifetime of the source.
pub struct NestedSource {
    outer: Arc<dyn ArchiveSource>,
    member: String,
    inner_type: StoreType,
    storage: StorageConfig,
    inner: Mutex<Option<Arc<dyn ArchiveSource>>>,
}

impl NestedSource {
    /// # Errors
    ///
    /// Returns a configuration error when the member name is empty or the
    /// inner store type cannot live inside another archive.
    pub fn new(
        outer: Arc<dyn ArchiveSource>,
        inner_type: StoreType,
        member: impl Into<String>,
        storage: StorageConfig,
    ) -> Result<Self> {
        let member = member.into();
        if member.is_empty() {
            return Err(DatasetError::config("nested source needs an inner member name"));
        }
        if matches!(inner_type, StoreType::Dir | StoreType::MemCache | StoreType::Nested) {
            return Err(DatasetError::config(format!(
                "{inner_type:?} cannot be nested inside an archive"
            )));
        }
        Ok(Self {
            outer,
            member,
            inner_type,
            storage,
            inner: Mutex::new(None),
        })
    }

    fn label(&self) -> String {
        format!("{}!{}", self.outer.location(), self.member)
    }

    fn inner(&self) -> Result<Arc<dyn ArchiveSource>> {
        let mut inner = self.inner.lock();
        if let Some(source) = inner.as_ref() {
            return Ok(Arc::clone(source));
        }

        let data = match self.outer.open()?.raw_member(&self.member)? {
            Member::Raw { data, .. } => data,
            Member::Record(record) => record.persisted_bytes()?,
        };
        tracing::debug!(
            outer = %self.outer.location(),
            member = %self.member,
            bytes = data.len(),
            "inner archive loaded"
        );
        let source = self
            .inner_type
            .open_source(Location::memory(self.label(), data), &self.storage)?;
        *inner = Some(Arc::clone(&source));
        Ok(source)
    }
}

impl fmt::Debug for NestedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedSource")
            .field("outer", &self.outer.location())
            .field("member", &self.member)
            .field("inner_type", &self.inner_type)
            .finish()
    }
}

impl ArchiveSource for NestedSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        self.inner()?.open()
    }

    fn member_names(&self) -> Result<Vec<String>> {
        self.inner()?.member_names()
    }

    fn lists_member(&self, member: &str, datatype: DataType) -> bool {
        match self.inner() {
            Ok(inner) => inner.lists_member(member, datatype),
            Err(_) => datatype.matches(member),
        }
    }

    fn supports_disk_cache(&self) -> bool {
        true
    }

    fn for_each_member(&self, visitor: &mut MemberVisitor<'_>) -> Result<()> {
        self.inner()?.for_each_member(visitor)
    }

    fn cache_key(&self) -> String {
        format!("nested:{}!{}", self.outer.cache_key(), self.member)
    }

    fn location(&self) -> String {
        self.label()
    }
}
