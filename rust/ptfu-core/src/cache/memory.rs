// rust/ptfu-core/src/cache/memory.rs

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::record::Record;

/// In-process name to record map without eviction.
///
/// Lives as long as the reader that owns it.
#[derive(Debug, Default)]
pub struct MemCache {
    records: RwLock<HashMap<String, Record>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the cached record, if any.
    pub fn read(&self, name: &str) -> Option<Record> {
        self.records.read().get(name).cloned()
    }

    pub fn write(&self, name: impl Into<String>, record: Record) {
        self.records.write().insert(name.into(), record);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.read().contains_key(name)
    }

    /// All cached names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The subset of `names` that is cached.
    pub fn hit_names<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let records = self.records.read();
        names
            .into_iter()
            .filter(|n| records.contains_key(n.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
