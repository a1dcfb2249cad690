// rust/ptfu-core/src/archive/reader.rs

//! Cached, parallel reads over any [`ArchiveSource`].
//!
//! Lookups go through the memory cache, then the disk cache (decoded records
//! first, then raw members extracted by the warm-up), then the source itself.
//! Bulk reads push records into a [`DataQueue`] from detached partition
//! workers so that a consumer can start writing before reading has finished.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;

use super::{ArchiveSource, Member};
use crate::cache::{DiskCacheLease, DiskCacheRegistry, MemCache};
use crate::config::PtfuConfig;
use crate::datatype::DataType;
use crate::error::{DatasetError, Result};
use crate::queue::DataQueue;
use crate::record::Record;
use crate::storetype::SourceSpec;

enum CacheHit {
    Memory(Record),
    Disk(Record),
}

pub struct ArchiveReader {
    source: Arc<dyn ArchiveSource>,
    mem_cache: Option<Arc<MemCache>>,
    disk_cache: Option<Arc<DiskCacheLease>>,
    namelists: Mutex<HashMap<DataType, BTreeSet<String>>>,
    config: PtfuConfig,
    warmup_stop: Arc<AtomicBool>,
    warmup: Mutex<Option<JoinHandle<()>>>,
}

impl ArchiveReader {
    pub fn builder() -> ArchiveReaderBuilder {
        ArchiveReaderBuilder::new()
    }

    pub fn source(&self) -> &Arc<dyn ArchiveSource> {
        &self.source
    }

    pub fn location(&self) -> String {
        self.source.location()
    }

    pub fn mem_cache(&self) -> Option<&Arc<MemCache>> {
        self.mem_cache.as_ref()
    }

    pub fn disk_cache(&self) -> Option<&DiskCacheLease> {
        self.disk_cache.as_deref()
    }

    /// Names of members listed for `datatype`.
    ///
    /// The result is kept per datatype; pass `allow_cached = false` to list
    /// the source again after it changed.
    pub fn namelist(&self, datatype: DataType, allow_cached: bool) -> Result<BTreeSet<String>> {
        if allow_cached {
            if let Some(names) = self.namelists.lock().get(&datatype) {
                return Ok(names.clone());
            }
        }
        let names: BTreeSet<String> = self
            .source
            .member_names()?
            .into_iter()
            .filter(|m| self.source.lists_member(m, datatype))
            .collect();
        self.namelists.lock().insert(datatype, names.clone());
        Ok(names)
    }

    pub fn datanumber(&self, datatype: DataType, allow_cached: bool) -> Result<usize> {
        self.namelist(datatype, allow_cached).map(|n| n.len())
    }

    /// Reads one record.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::NotFound`] if `name` is not in the source, and
    /// source errors as they occur.
    pub fn getbyname(&self, name: &str, datatype: DataType) -> Result<Record> {
        match self.lookup_cache(name, datatype) {
            Some(CacheHit::Memory(record)) => return Ok(record),
            Some(CacheHit::Disk(record)) => {
                if let Some(mem) = &self.mem_cache {
                    mem.write(cache_entry(name, datatype), record.clone());
                }
                return Ok(record);
            }
            None => {}
        }

        let mut handle = self.source.open()?;
        let record = handle.find(name, datatype)?.into_record(name, datatype)?;
        if let Some(mem) = &self.mem_cache {
            mem.write(cache_entry(name, datatype), record.clone());
        }
        if let Some(disk) = self.persisting_disk_cache() {
            persist(&disk, datatype, &record);
        }
        Ok(record)
    }

    /// Reads every name it can find, in the order requested. Missing names
    /// are dropped.
    pub fn getbylist(
        &self,
        names: &[String],
        datatype: DataType,
        max_workers: Option<usize>,
    ) -> Result<Vec<Record>> {
        let queue = self.getbylist_q(names, datatype, None, max_workers)?;
        let position: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .rev()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut records = queue.read_all();
        records.sort_by_key(|r| position.get(r.name.as_str()).copied().unwrap_or(usize::MAX));
        Ok(records)
    }

    /// Pushes every record it can find into `queue` (a new queue expecting
    /// `names.len()` records when `None`) and returns the queue.
    ///
    /// Reads from the source run on detached worker threads; each name that
    /// cannot be read shrinks the queue's expected size. A caller-supplied
    /// queue keeps the expected size its owner gave it.
    pub fn getbylist_q(
        &self,
        names: &[String],
        datatype: DataType,
        queue: Option<Arc<DataQueue<Record>>>,
        max_workers: Option<usize>,
    ) -> Result<Arc<DataQueue<Record>>> {
        let mut seen = HashSet::with_capacity(names.len());
        let names: Vec<String> = names
            .iter()
            .filter(|n| seen.insert(n.as_str()))
            .cloned()
            .collect();
        let queue = queue.unwrap_or_else(|| {
            Arc::new(
                DataQueue::new(names.len() as i64).with_pop_timeout(self.config.queue.pop_timeout()),
            )
        });

        let mut remaining = Vec::with_capacity(names.len());
        let mut disk_hits = Vec::new();
        for name in names {
            match self.lookup_cache(&name, datatype) {
                Some(CacheHit::Memory(record)) => queue.push(record)?,
                Some(CacheHit::Disk(record)) => {
                    disk_hits.push(record.clone());
                    queue.push(record)?;
                }
                None => remaining.push(name),
            }
        }
        if !disk_hits.is_empty() {
            if let Some(mem) = &self.mem_cache {
                let mem = Arc::clone(mem);
                thread::spawn(move || {
                    for record in disk_hits {
                        mem.write(cache_entry(&record.name, datatype), record);
                    }
                });
            }
        }
        if remaining.is_empty() {
            return Ok(queue);
        }

        let workers = max_workers.unwrap_or_else(|| self.config.reader.workers()).max(1);
        let partitions = partition(remaining, workers, self.config.reader.partition_factor);
        let total: usize = partitions.iter().map(Vec::len).sum();

        let cache_queue = self.mem_cache.as_ref().map(|mem| {
            let cache_queue = Arc::new(
                DataQueue::<Record>::new(total as i64).with_pop_timeout(self.config.queue.pop_timeout()),
            );
            let drain = Arc::clone(&cache_queue);
            let mem = Arc::clone(mem);
            thread::spawn(move || {
                let timeout = drain.pop_timeout_duration();
                let mut cached = 0usize;
                while drain.has_next() {
                    if let Some(record) = drain.pop_timeout(timeout) {
                        mem.write(cache_entry(&record.name, datatype), record);
                        cached += 1;
                    }
                }
                tracing::debug!(cached, "memory cache filled");
            });
            cache_queue
        });

        tracing::debug!(
            source = %self.source.location(),
            datatype = %datatype,
            names = total,
            partitions = partitions.len(),
            "bulk read started"
        );

        let ctx = PartitionContext {
            source: Arc::clone(&self.source),
            datatype,
            output: Arc::clone(&queue),
            cache_queue,
            disk: self.persisting_disk_cache(),
        };
        for names in partitions {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.read(names));
        }
        Ok(queue)
    }

    /// Pushes every record listed for `datatype` into `queue`.
    pub fn getallbyqueue(
        &self,
        datatype: DataType,
        queue: Option<Arc<DataQueue<Record>>>,
        max_workers: Option<usize>,
    ) -> Result<Arc<DataQueue<Record>>> {
        let names: Vec<String> = self.namelist(datatype, true)?.into_iter().collect();
        self.getbylist_q(&names, datatype, queue, max_workers)
    }

    /// Blocks until the disk cache warm-up, if any, has finished.
    pub fn wait_disk_cache_ready(&self) {
        let handle = self.warmup.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(source = %self.source.location(), "disk cache warm-up panicked");
            }
        }
    }

    pub fn is_disk_cache_ready(&self) -> bool {
        self.warmup
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    fn lookup_cache(&self, name: &str, datatype: DataType) -> Option<CacheHit> {
        let entry = cache_entry(name, datatype);
        if let Some(record) = self.mem_cache.as_ref().and_then(|mem| mem.read(&entry)) {
            return Some(CacheHit::Memory(record));
        }
        let disk = self.disk_cache.as_ref()?;

        match disk.read(&entry) {
            Ok(Some(record)) => return Some(CacheHit::Disk(record)),
            Ok(None) => {}
            Err(e) => tracing::warn!(name, error = %e, "ignoring unreadable disk cache entry"),
        }

        for candidate in datatype.candidates(name) {
            match disk.read_member(&candidate) {
                Ok(Some(data)) => match Member::raw(data).into_record(name, datatype) {
                    Ok(record) => return Some(CacheHit::Disk(record)),
                    Err(e) => {
                        tracing::debug!(name, error = %e, "cached member did not decode");
                        return None;
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(name, error = %e, "ignoring unreadable disk cache member"),
            }
        }
        None
    }

    fn persisting_disk_cache(&self) -> Option<Arc<DiskCacheLease>> {
        self.disk_cache
            .as_ref()
            .filter(|lease| lease.is_owner() && self.config.cache.persist_decoded)
            .cloned()
    }

    fn start_warmup(&self) {
        let Some(disk) = self.disk_cache.clone() else {
            return;
        };
        let source = Arc::clone(&self.source);
        let stop = Arc::clone(&self.warmup_stop);

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut extracted = 0usize;
            let result = source.for_each_member(&mut |name, data| {
                if stop.load(Ordering::Relaxed) {
                    return Ok(false);
                }
                if !disk.contains_member(name) {
                    disk.write_member(name, &data)?;
                    extracted += 1;
                }
                Ok(true)
            });
            match result {
                Ok(()) if stop.load(Ordering::Relaxed) => {
                    tracing::debug!(source = %source.location(), extracted, "disk cache warm-up stopped")
                }
                Ok(()) => tracing::info!(
                    source = %source.location(),
                    extracted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "disk cache ready"
                ),
                Err(e) => {
                    tracing::warn!(source = %source.location(), error = %e, "disk cache warm-up failed")
                }
            }
        });
        *self.warmup.lock() = Some(handle);
    }
}

impl Drop for ArchiveReader {
    fn drop(&mut self) {
        self.warmup_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.warmup.get_mut().take() {
            let _ = handle.join();
        }
    }
}

// Decoded records are cached per datatype: the same member decodes to
// different records under different types.
fn cache_entry(name: &str, datatype: DataType) -> String {
    format!("{datatype}:{name}")
}

fn persist(disk: &DiskCacheLease, datatype: DataType, record: &Record) {
    if let Err(e) = disk.write(&cache_entry(&record.name, datatype), record) {
        tracing::warn!(name = %record.name, error = %e, "failed to persist record to disk cache");
    }
}

/// Splits `names` into `workers` balanced partitions when there are at least
/// `factor * workers` of them, otherwise keeps a single partition.
fn partition(names: Vec<String>, workers: usize, factor: usize) -> Vec<Vec<String>> {
    if workers <= 1 || names.len() < factor.saturating_mul(workers) {
        return vec![names];
    }
    let base = names.len() / workers;
    let extra = names.len() % workers;
    let mut names = names.into_iter();
    (0..workers)
        .map(|i| names.by_ref().take(base + usize::from(i < extra)).collect())
        .collect()
}

#[derive(Clone)]
struct PartitionContext {
    source: Arc<dyn ArchiveSource>,
    datatype: DataType,
    output: Arc<DataQueue<Record>>,
    cache_queue: Option<Arc<DataQueue<Record>>>,
    disk: Option<Arc<DiskCacheLease>>,
}

impl PartitionContext {
    fn skip(&self, n: usize) {
        self.output.shrink_expected(n);
        if let Some(cache_queue) = &self.cache_queue {
            cache_queue.shrink_expected(n);
        }
    }

    fn read(&self, names: Vec<String>) {
        let mut handle = match self.source.open() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    source = %self.source.location(),
                    skipped = names.len(),
                    error = %e,
                    "failed to open source for partition"
                );
                self.skip(names.len());
                return;
            }
        };

        for name in names {
            let result = handle
                .find(&name, self.datatype)
                .and_then(|member| member.into_record(&name, self.datatype));
            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(name, source = %self.source.location(), "name not in source");
                    self.skip(1);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(name, source = %self.source.location(), error = %e, "failed to read record");
                    self.skip(1);
                    continue;
                }
            };

            if let Some(disk) = &self.disk {
                persist(disk, self.datatype, &record);
            }
            if let Some(cache_queue) = &self.cache_queue {
                if let Err(e) = cache_queue.push(record.clone()) {
                    tracing::warn!(name, error = %e, "failed to queue record for caching");
                }
            }
            if let Err(e) = self.output.push(record) {
                tracing::warn!(name, error = %e, "failed to deliver record");
            }
        }
    }
}

/// Builder for [`ArchiveReader`].
pub struct ArchiveReaderBuilder {
    source: Option<Arc<dyn ArchiveSource>>,
    spec: Option<SourceSpec>,
    config: PtfuConfig,
    registry: Option<DiskCacheRegistry>,
    use_cache: bool,
}

impl ArchiveReaderBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            spec: None,
            config: PtfuConfig::default(),
            registry: None,
            use_cache: true,
        }
    }

    /// Reads from an already constructed source.
    pub fn source(mut self, source: Arc<dyn ArchiveSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Reads from the source described by `spec`, opened at build time.
    pub fn spec(mut self, spec: SourceSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn config(mut self, config: PtfuConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares disk caches with other readers built from the same registry.
    pub fn registry(mut self, registry: DiskCacheRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enables or disables both cache tiers.
    pub fn use_cache(mut self, enable: bool) -> Self {
        self.use_cache = enable;
        self
    }

    /// Builds the reader and, when it owns a fresh disk cache, starts the
    /// warm-up.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no source was given, or the error
    /// raised while opening the source spec or the disk cache.
    pub fn build(self) -> Result<ArchiveReader> {
        let source = match (self.source, &self.spec) {
            (Some(source), _) => source,
            (None, Some(spec)) => spec.open(&self.config.storage)?,
            (None, None) => return Err(DatasetError::config("reader source is required")),
        };

        let caching = self.use_cache;
        let mem_cache = (caching && self.config.cache.memory).then(|| Arc::new(MemCache::new()));

        let disk_cache = if caching && self.config.cache.disk && source.supports_disk_cache() {
            let registry = self
                .registry
                .unwrap_or_else(|| DiskCacheRegistry::new(self.config.cache.clone()));
            Some(Arc::new(registry.acquire(&source.cache_key())?))
        } else {
            None
        };
        let owns_disk_cache = disk_cache.as_ref().is_some_and(|lease| lease.is_owner());

        let reader = ArchiveReader {
            source,
            mem_cache,
            disk_cache,
            namelists: Mutex::new(HashMap::new()),
            config: self.config,
            warmup_stop: Arc::new(AtomicBool::new(false)),
            warmup: Mutex::new(None),
        };
        if owns_disk_cache {
            reader.start_warmup();
        }
        Ok(reader)
    }
}

impl Default for ArchiveReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
