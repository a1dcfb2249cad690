// rust/ptfu-core/src/cache/registry.rs

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use super::disk::DiskCache;
use crate::config::CacheConfig;
use crate::error::Result;

/// Shares disk caches between readers of the same source.
///
/// The first reader to acquire a key creates the cache and owns it. Later
/// readers get a non-owning lease on the same directory. When the owner's
/// lease is dropped the entry is removed and the directory deleted; readers
/// still holding a lease then see misses.
#[derive(Clone, Default)]
pub struct DiskCacheRegistry {
    config: CacheConfig,
    entries: Arc<Mutex<HashMap<String, Arc<DiskCache>>>>,
}

impl DiskCacheRegistry {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a lease on the cache for `key`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a new cache directory cannot be created.
    pub fn acquire(&self, key: &str) -> Result<DiskCacheLease> {
        let mut entries = self.entries.lock();
        if let Some(cache) = entries.get(key) {
            return Ok(DiskCacheLease {
                cache: Arc::clone(cache),
                key: key.to_string(),
                owner: false,
                entries: Arc::clone(&self.entries),
            });
        }

        let cache = Arc::new(DiskCache::new(&self.config)?);
        entries.insert(key.to_string(), Arc::clone(&cache));
        tracing::debug!(key, path = %cache.path().display(), "disk cache registered");
        Ok(DiskCacheLease {
            cache,
            key: key.to_string(),
            owner: true,
            entries: Arc::clone(&self.entries),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A handle on a registered [`DiskCache`].
pub struct DiskCacheLease {
    cache: Arc<DiskCache>,
    key: String,
    owner: bool,
    entries: Arc<Mutex<HashMap<String, Arc<DiskCache>>>>,
}

impl DiskCacheLease {
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Deref for DiskCacheLease {
    type Target = DiskCache;

    fn deref(&self) -> &DiskCache {
        &self.cache
    }
}

impl Drop for DiskCacheLease {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        {
            let mut entries = self.entries.lock();
            if entries
                .get(&self.key)
                .is_some_and(|c| Arc::ptr_eq(c, &self.cache))
            {
                entries.remove(&self.key);
            }
        }
        if let Err(e) = self.cache.close() {
            tracing::warn!(key = %self.key, error = %e, "failed to remove disk cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn test_first_acquirer_owns() {
        let registry = DiskCacheRegistry::default();
        let owner = registry.acquire("tar:/data/a.tar").unwrap();
        let follower = registry.acquire("tar:/data/a.tar").unwrap();

        assert!(owner.is_owner());
        assert!(!follower.is_owner());
        assert_eq!(owner.path(), follower.path());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_followers_share_entries() {
        let registry = DiskCacheRegistry::default();
        let owner = registry.acquire("k").unwrap();
        let follower = registry.acquire("k").unwrap();

        owner.write("a", &Record::bytes("a", b"1".to_vec())).unwrap();
        assert!(follower.read("a").unwrap().is_some());
    }

    #[test]
    fn test_follower_drop_keeps_cache() {
        let registry = DiskCacheRegistry::default();
        let owner = registry.acquire("k").unwrap();
        let follower = registry.acquire("k").unwrap();
        drop(follower);

        assert!(registry.contains("k"));
        assert!(owner.path().exists());
    }

    #[test]
    fn test_owner_drop_removes_cache() {
        let registry = DiskCacheRegistry::default();
        let owner = registry.acquire("k").unwrap();
        let follower = registry.acquire("k").unwrap();
        owner.write("a", &Record::bytes("a", b"1".to_vec())).unwrap();
        let root = owner.path().to_path_buf();

        drop(owner);
        assert!(!registry.contains("k"));
        assert!(!root.exists());
        assert!(follower.read("a").unwrap().is_none());

        // The next acquirer starts a fresh cache and owns it
        let next = registry.acquire("k").unwrap();
        assert!(next.is_owner());
        assert_ne!(next.path(), root.as_path());
    }
}
