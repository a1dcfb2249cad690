// rust/ptfu-core/src/creator.rs

//! Dataset creation pipeline.
//!
//! [`DatasetCreator::create`] runs five phases on OS threads connected by
//! [`DataQueue`]s:
//!
//! 1. every source reader pushes its records into one queue sized to the
//!    total record count;
//! 2. an optional filter is applied to each payload by a pool of threads;
//! 3. the queue is split into one sub-queue per destination group;
//! 4. one writer thread per group drains its sub-queue into the destination;
//! 5. the calling thread logs progress until all writers have finished.

use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::archive::{ArchiveReader, ArchiveWriter, BatchOutcome};
use crate::cache::{DiskCacheRegistry, MemCache};
use crate::config::PtfuConfig;
use crate::datatype::DataType;
use crate::error::{DatasetError, Result};
use crate::queue::DataQueue;
use crate::record::{Payload, Record};
use crate::storetype::{cache_writer, SourceSpec, StoreType};

/// Payload transformation applied in the filtering phase. An error or a panic
/// drops the record.
pub type FilterFn = Arc<
    dyn Fn(Payload) -> std::result::Result<Payload, Box<dyn StdError + Send + Sync>> + Send + Sync,
>;

const MONITOR_POLL: Duration = Duration::from_millis(10);

/// How records are distributed over destination groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitManner {
    /// A fixed number of groups.
    ByGroups(usize),
    /// A fixed number of records per group; the last group takes the rest.
    ByCountPerGroup(usize),
}

impl Default for SplitManner {
    fn default() -> Self {
        SplitManner::ByGroups(1)
    }
}

/// Group sizes for `total` records. Sizes always sum to `total`.
///
/// `ByGroups` hands the remainder out one by one to the earliest groups and
/// never creates more groups than records.
pub fn split_sizes(total: usize, manner: SplitManner) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    match manner {
        SplitManner::ByGroups(n) => {
            let n = n.clamp(1, total);
            let base = total / n;
            let extra = total % n;
            (0..n).map(|i| base + usize::from(i < extra)).collect()
        }
        SplitManner::ByCountPerGroup(k) => {
            let k = k.max(1);
            let groups = total.div_ceil(k);
            let mut sizes = vec![k; groups];
            sizes[groups - 1] = total - k * (groups - 1);
            sizes
        }
    }
}

/// Splits `queue` into sub-queues of the given sizes.
///
/// One detached thread per sub-queue pops its assigned count from `queue`.
/// When `queue` runs dry early the sub-queue's expected size shrinks by the
/// shortfall, so consumers of every sub-queue still terminate.
pub fn split_queue<T: Send + 'static>(
    queue: &Arc<DataQueue<T>>,
    sizes: &[usize],
) -> Vec<Arc<DataQueue<T>>> {
    let timeout = queue.pop_timeout_duration();
    sizes
        .iter()
        .enumerate()
        .map(|(group, &size)| {
            let sub = Arc::new(DataQueue::new(size as i64).with_pop_timeout(timeout));
            let input = Arc::clone(queue);
            let output = Arc::clone(&sub);
            thread::spawn(move || {
                let mut taken = 0;
                while taken < size {
                    if !input.has_next() {
                        tracing::debug!(group, shortfall = size - taken, "source queue ran dry");
                        output.shrink_expected(size - taken);
                        break;
                    }
                    let Some(item) = input.pop_timeout(timeout) else {
                        continue;
                    };
                    if let Err(e) = output.push(item) {
                        tracing::warn!(group, error = %e, "failed to fill group queue");
                        output.shrink_expected(1);
                    }
                    taken += 1;
                }
            });
            sub
        })
        .collect()
}

/// Pipeline progress, advanced by [`DatasetCreator::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorState {
    Configured,
    Reading,
    Filtering,
    Splitting,
    Writing,
    Monitoring,
    Done,
}

/// Summary of one `create` run.
#[derive(Debug, Default)]
pub struct CreationReport {
    /// Records found in the sources.
    pub total: usize,
    /// Records written, over all groups.
    pub written: usize,
    /// Planned record count per group.
    pub group_sizes: Vec<usize>,
    /// Destinations, one per group.
    pub destinations: Vec<String>,
    /// Records (or whole destinations) that did not make it, with the reason.
    pub failed: Vec<(String, DatasetError)>,
}

impl CreationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.written == self.total
    }
}

enum Destination {
    Files { store: StoreType, dir: PathBuf },
    Cache(Arc<MemCache>),
}

impl Destination {
    fn describe(&self, name: &str) -> String {
        match self {
            Destination::Files { store, dir } => store.destination(dir, name).display().to_string(),
            Destination::Cache(_) => format!("memory cache ({name})"),
        }
    }

    fn writer(&self, name: &str, config: &PtfuConfig) -> Result<Box<dyn ArchiveWriter>> {
        match self {
            Destination::Files { store, dir } => {
                store.create_writer(store.destination(dir, name), &config.storage)
            }
            Destination::Cache(cache) => Ok(cache_writer(Arc::clone(cache))),
        }
    }
}

/// Reads one or more sources and writes their records into split
/// destination archives.
pub struct DatasetCreator {
    datatype: DataType,
    readers: Vec<ArchiveReader>,
    destination: Destination,
    name: String,
    manner: SplitManner,
    config: PtfuConfig,
    state: Mutex<CreatorState>,
}

impl DatasetCreator {
    pub fn builder() -> DatasetCreatorBuilder {
        DatasetCreatorBuilder::new()
    }

    pub fn state(&self) -> CreatorState {
        *self.state.lock()
    }

    fn set_state(&self, state: CreatorState) {
        *self.state.lock() = state;
        tracing::debug!(dataset = %self.name, ?state, "creator state");
    }

    /// Total records over all sources.
    pub fn datanumber(&self) -> Result<usize> {
        let mut total = 0;
        for reader in &self.readers {
            total += reader.datanumber(self.datatype, true)?;
        }
        Ok(total)
    }

    /// Destination names, one per group, for `groups` groups.
    pub fn group_names(&self, groups: usize) -> Vec<String> {
        if groups <= 1 {
            vec![self.name.clone()]
        } else {
            (1..=groups).map(|i| format!("{}-{i}", self.name)).collect()
        }
    }

    /// Runs the pipeline and blocks until every destination is written.
    ///
    /// # Errors
    ///
    /// Fails only when the sources cannot be counted; per-record and
    /// per-destination failures are collected into the report.
    pub fn create(&self, filter: Option<FilterFn>) -> Result<CreationReport> {
        let total = self.datanumber()?;
        let sizes = split_sizes(total, self.manner);
        let names = self.group_names(sizes.len());
        let destinations: Vec<String> =
            names.iter().map(|n| self.destination.describe(n)).collect();

        tracing::info!(
            dataset = %self.name,
            datatype = %self.datatype,
            sources = self.readers.len(),
            records = total,
            groups = sizes.len(),
            "dataset creation started"
        );
        if total == 0 {
            self.set_state(CreatorState::Done);
            tracing::info!(dataset = %self.name, "no records found, nothing to write");
            return Ok(CreationReport::default());
        }

        let failed = Arc::new(Mutex::new(Vec::new()));
        let timeout = self.config.queue.pop_timeout();

        self.set_state(CreatorState::Reading);
        let read_queue = Arc::new(DataQueue::new(total as i64).with_pop_timeout(timeout));
        for reader in &self.readers {
            let result = reader.getallbyqueue(self.datatype, Some(Arc::clone(&read_queue)), Some(1));
            if let Err(e) = result {
                let missing = reader.datanumber(self.datatype, true).unwrap_or(0);
                tracing::warn!(source = %reader.location(), error = %e, "failed to read source");
                read_queue.shrink_expected(missing);
                failed.lock().push((reader.location(), e));
            }
        }

        let queue = match filter {
            Some(filter) => {
                self.set_state(CreatorState::Filtering);
                self.filter(&read_queue, filter, total, &failed)
            }
            None => read_queue,
        };

        self.set_state(CreatorState::Splitting);
        let groups = split_queue(&queue, &sizes);

        self.set_state(CreatorState::Writing);
        let mut writers: Vec<(String, JoinHandle<Result<BatchOutcome>>)> =
            Vec::with_capacity(groups.len());
        for ((group, name), destination) in groups.iter().zip(&names).zip(&destinations) {
            let mut writer = match self.destination.writer(name, &self.config) {
                Ok(writer) => writer,
                Err(e) => {
                    failed.lock().push((destination.clone(), e));
                    continue;
                }
            };
            let group = Arc::clone(group);
            writers.push((
                destination.clone(),
                thread::spawn(move || writer.write_by_queue(&group)),
            ));
        }

        self.set_state(CreatorState::Monitoring);
        self.monitor(&groups, &destinations, &writers);

        let mut report = CreationReport {
            total,
            group_sizes: sizes,
            destinations: destinations.clone(),
            ..CreationReport::default()
        };
        for (destination, handle) in writers {
            match handle.join() {
                Ok(Ok(outcome)) => {
                    report.written += outcome.processed;
                    report.failed.extend(outcome.failed);
                }
                Ok(Err(e)) => {
                    tracing::warn!(destination = %destination, error = %e, "destination failed");
                    report.failed.push((destination, e));
                }
                Err(_) => report.failed.push((
                    destination.clone(),
                    DatasetError::queue(format!("writer thread for {destination} panicked")),
                )),
            }
        }
        report.failed.extend(std::mem::take(&mut *failed.lock()));

        self.set_state(CreatorState::Done);
        tracing::info!(
            dataset = %self.name,
            written = report.written,
            failed = report.failed.len(),
            "dataset creation finished"
        );
        Ok(report)
    }

    // The output expects `total` until every worker has exited, then exactly
    // the number of records forwarded. Reads that failed upstream, rejected
    // records and panicking filters all end up below that count.
    fn filter(
        &self,
        input: &Arc<DataQueue<Record>>,
        filter: FilterFn,
        total: usize,
        failed: &Arc<Mutex<Vec<(String, DatasetError)>>>,
    ) -> Arc<DataQueue<Record>> {
        let timeout = input.pop_timeout_duration();
        let output = Arc::new(DataQueue::new(total as i64).with_pop_timeout(timeout));
        let forwarded = Arc::new(AtomicUsize::new(0));
        let workers: Vec<JoinHandle<()>> = (0..self.config.creator.filter_workers())
            .map(|_| {
                let input = Arc::clone(input);
                let output = Arc::clone(&output);
                let forwarded = Arc::clone(&forwarded);
                let filter = Arc::clone(&filter);
                let failed = Arc::clone(failed);
                thread::spawn(move || {
                    while input.has_next() {
                        let Some(record) = input.pop_timeout(timeout) else {
                            continue;
                        };
                        let Record {
                            name,
                            payload,
                            label,
                        } = record;
                        let result = panic::catch_unwind(AssertUnwindSafe(|| filter(payload)))
                            .unwrap_or_else(|_| Err("filter panicked".into()));
                        match result {
                            Ok(payload) => {
                                let record = Record {
                                    name,
                                    payload,
                                    label,
                                };
                                match output.push(record) {
                                    Ok(()) => {
                                        forwarded.fetch_add(1, Ordering::SeqCst);
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "failed to forward filtered record");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(name = %name, error = %e, "filter rejected record");
                                let error = DatasetError::filter(name.clone(), e.to_string());
                                failed.lock().push((name, error));
                            }
                        }
                    }
                })
            })
            .collect();

        {
            let output = Arc::clone(&output);
            thread::spawn(move || {
                for worker in workers {
                    if worker.join().is_err() {
                        tracing::warn!("filter worker panicked");
                    }
                }
                let forwarded = forwarded.load(Ordering::SeqCst);
                tracing::debug!(forwarded, "filtering finished");
                output.set_expected(forwarded as i64);
            });
        }
        output
    }

    fn monitor(
        &self,
        groups: &[Arc<DataQueue<Record>>],
        destinations: &[String],
        writers: &[(String, JoinHandle<Result<BatchOutcome>>)],
    ) {
        let interval = self.config.creator.monitor_interval();
        let mut last_report = Instant::now();
        while !writers.iter().all(|(_, handle)| handle.is_finished()) {
            if last_report.elapsed() >= interval {
                for (group, destination) in groups.iter().zip(destinations) {
                    tracing::info!(
                        destination = %destination,
                        pushed = group.pushed_number(),
                        written = group.popped_number(),
                        expected = group.datanumber(),
                        "dataset creation progress"
                    );
                }
                last_report = Instant::now();
            }
            thread::sleep(MONITOR_POLL.min(interval));
        }
    }
}

impl fmt::Debug for DatasetCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetCreator")
            .field("datatype", &self.datatype)
            .field("sources", &self.readers.len())
            .field("name", &self.name)
            .field("manner", &self.manner)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`DatasetCreator`].
pub struct DatasetCreatorBuilder {
    datatype: DataType,
    sources: Vec<SourceSpec>,
    readers: Vec<ArchiveReader>,
    dst_type: Option<StoreType>,
    dst_dir: Option<PathBuf>,
    dst_cache: Option<Arc<MemCache>>,
    name: Option<String>,
    manner: SplitManner,
    config: PtfuConfig,
    registry: Option<DiskCacheRegistry>,
    use_cache: bool,
}

impl DatasetCreatorBuilder {
    pub fn new() -> Self {
        Self {
            datatype: DataType::Other,
            sources: Vec::new(),
            readers: Vec::new(),
            dst_type: None,
            dst_dir: None,
            dst_cache: None,
            name: None,
            manner: SplitManner::default(),
            config: PtfuConfig::default(),
            registry: None,
            use_cache: false,
        }
    }

    /// Sets the type of the records to collect.
    pub fn datatype(mut self, datatype: DataType) -> Self {
        self.datatype = datatype;
        self
    }

    /// Adds a source.
    pub fn source(mut self, spec: SourceSpec) -> Self {
        self.sources.push(spec);
        self
    }

    /// Adds an already built reader as a source.
    pub fn reader(mut self, reader: ArchiveReader) -> Self {
        self.readers.push(reader);
        self
    }

    /// Sets the destination store type and the directory destinations go in.
    pub fn destination(mut self, store: StoreType, dir: impl Into<PathBuf>) -> Self {
        self.dst_type = Some(store);
        self.dst_dir = Some(dir.into());
        self
    }

    /// Writes every group into `cache` instead of files.
    pub fn cache_destination(mut self, cache: Arc<MemCache>) -> Self {
        self.dst_type = Some(StoreType::MemCache);
        self.dst_cache = Some(cache);
        self
    }

    /// Sets the dataset name destinations are named after.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn split(mut self, manner: SplitManner) -> Self {
        self.manner = manner;
        self
    }

    pub fn config(mut self, config: PtfuConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: DiskCacheRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enables reader caches for the sources (off by default).
    pub fn use_cache(mut self, enable: bool) -> Self {
        self.use_cache = enable;
        self
    }

    /// Opens every source and checks the destination settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for missing or inconsistent settings,
    /// or the error raised while opening a source.
    pub fn build(self) -> Result<DatasetCreator> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| DatasetError::config("dataset name is required"))?;
        if self.sources.is_empty() && self.readers.is_empty() {
            return Err(DatasetError::config("at least one source is required"));
        }
        if matches!(self.manner, SplitManner::ByGroups(0) | SplitManner::ByCountPerGroup(0)) {
            return Err(DatasetError::config("split size must be at least 1"));
        }

        let destination = match (self.dst_type, self.dst_dir, self.dst_cache) {
            (Some(StoreType::MemCache), _, Some(cache)) => Destination::Cache(cache),
            (Some(StoreType::MemCache), _, None) => {
                return Err(DatasetError::config("memory cache destination needs a cache"))
            }
            (Some(store), Some(dir), _) if store.has_writer() => Destination::Files { store, dir },
            (Some(store), Some(_), _) => {
                return Err(DatasetError::config(format!("{store:?} cannot be a destination")))
            }
            _ => return Err(DatasetError::config("destination is required")),
        };

        let registry = self
            .registry
            .unwrap_or_else(|| DiskCacheRegistry::new(self.config.cache.clone()));
        let mut readers = self.readers;
        for spec in self.sources {
            readers.push(
                ArchiveReader::builder()
                    .spec(spec)
                    .config(self.config.clone())
                    .registry(registry.clone())
                    .use_cache(self.use_cache)
                    .build()?,
            );
        }

        Ok(DatasetCreator {
            datatype: self.datatype,
            readers,
            destination,
            name,
            manner: self.manner,
            config: self.config,
            state: Mutex::new(CreatorState::Configured),
        })
    }
}

impl Default for DatasetCreatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{DirWriter, ZipSource, Location};
    use crate::archive::ArchiveSource;
    use crate::record::NdArray;
    use tempfile::TempDir;

    fn fast_config() -> PtfuConfig {
        let mut config = PtfuConfig::default();
        config.queue.pop_timeout_ms = 5;
        config.creator.monitor_interval_ms = 20;
        config.creator.filter_workers = Some(3);
        config
    }

    fn write_source(dir: &std::path::Path, n: usize) {
        let records: Vec<Record> = (0..n)
            .map(|i| Record::array(format!("rec{i:03}"), NdArray::from_vec(vec![i as i32])))
            .collect();
        DirWriter::new(dir).write_by_list(&records).unwrap();
    }

    #[test]
    fn test_split_sizes_conserve_records() {
        for total in 1..=30 {
            for n in 1..=total {
                for manner in [SplitManner::ByGroups(n), SplitManner::ByCountPerGroup(n)] {
                    let sizes = split_sizes(total, manner);
                    assert_eq!(sizes.iter().sum::<usize>(), total, "{manner:?} of {total}");
                }
            }
        }
        assert_eq!(split_sizes(10, SplitManner::ByGroups(3)), vec![4, 3, 3]);
        assert_eq!(split_sizes(25, SplitManner::ByCountPerGroup(10)), vec![10, 10, 5]);
        assert_eq!(split_sizes(2, SplitManner::ByGroups(5)), vec![1, 1]);
        assert!(split_sizes(0, SplitManner::ByGroups(2)).is_empty());
    }

    #[test]
    fn test_split_queue_conserves_items() {
        let queue = Arc::new(DataQueue::new(17).with_pop_timeout(Duration::from_millis(5)));
        queue.put_all(0..17).unwrap();
        let sizes = split_sizes(17, SplitManner::ByGroups(4));
        let subs = split_queue(&queue, &sizes);

        let mut all: Vec<i32> = Vec::new();
        for (sub, size) in subs.iter().zip(&sizes) {
            let items = sub.read_all();
            assert_eq!(items.len(), *size);
            all.extend(items);
        }
        all.sort();
        assert_eq!(all, (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_queue_shrinks_on_shortfall() {
        let queue = Arc::new(DataQueue::new(6).with_pop_timeout(Duration::from_millis(5)));
        queue.put_all(0..4).unwrap();
        queue.shrink_expected(2);
        let subs = split_queue(&queue, &[3, 3]);
        let got: usize = subs.iter().map(|s| s.read_all().len()).sum();
        assert_eq!(got, 4);
    }

    #[test]
    fn test_create_splits_by_count_per_group() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        write_source(&src, 25);
        let dst = dir.path().join("dst");

        let creator = DatasetCreator::builder()
            .datatype(DataType::Npy)
            .source(SourceSpec::archive(StoreType::Dir, &src))
            .destination(StoreType::Zip, &dst)
            .name("train")
            .split(SplitManner::ByCountPerGroup(10))
            .config(fast_config())
            .build()
            .unwrap();
        assert_eq!(creator.state(), CreatorState::Configured);
        assert_eq!(creator.datanumber().unwrap(), 25);

        let report = creator.create(None).unwrap();
        assert_eq!(creator.state(), CreatorState::Done);
        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.group_sizes, vec![10, 10, 5]);
        assert_eq!(report.written, 25);

        let mut total = 0;
        for (i, size) in [10, 10, 5].into_iter().enumerate() {
            let path = dst.join(format!("train-{}.zip", i + 1));
            let source = ZipSource::new(Location::path(&path), PtfuConfig::default().storage);
            let names = source.member_names().unwrap();
            assert_eq!(names.len(), size);
            total += names.len();
        }
        assert_eq!(total, 25);
    }

    fn keep_first_byte(
        payload: Payload,
    ) -> std::result::Result<Payload, Box<dyn StdError + Send + Sync>> {
        match payload {
            Payload::Bytes(b) if b.as_ref() == b"bad" => Err("rejected".into()),
            Payload::Bytes(b) => Ok(Payload::Bytes(b.slice(..1))),
            array => Ok(array),
        }
    }

    #[test]
    fn test_failing_filter_drops_record() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let records: Vec<Record> = ["a", "b", "bad", "c", "d"]
            .iter()
            .map(|n| Record::bytes(*n, n.as_bytes().to_vec()))
            .collect();
        DirWriter::new(&src).write_by_list(&records).unwrap();

        let cache = Arc::new(MemCache::new());
        let creator = DatasetCreator::builder()
            .source(SourceSpec::archive(StoreType::Dir, &src))
            .cache_destination(Arc::clone(&cache))
            .name("filtered")
            .config(fast_config())
            .build()
            .unwrap();

        let filter: FilterFn = Arc::new(keep_first_byte);
        let report = creator.create(Some(filter)).unwrap();

        assert_eq!(report.total, 5);
        assert_eq!(report.written, 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert!(matches!(report.failed[0].1, DatasetError::Filter { .. }));
        assert_eq!(cache.names(), vec!["a", "b", "c", "d"]);
        assert!(!cache.contains("bad"));
    }

    fn source_with_corrupt_member(dir: &std::path::Path) -> PathBuf {
        let src = dir.join("src");
        write_source(&src, 3);
        std::fs::write(src.join("broken.npy"), b"not an npy").unwrap();
        src
    }

    fn cache_creator(src: &std::path::Path, cache: &Arc<MemCache>) -> DatasetCreator {
        DatasetCreator::builder()
            .datatype(DataType::Npy)
            .source(SourceSpec::archive(StoreType::Dir, src))
            .cache_destination(Arc::clone(cache))
            .name("partial")
            .config(fast_config())
            .build()
            .unwrap()
    }

    fn identity(payload: Payload) -> std::result::Result<Payload, Box<dyn StdError + Send + Sync>> {
        Ok(payload)
    }

    #[test]
    fn test_unreadable_record_skipped_without_filter() {
        let dir = TempDir::new().unwrap();
        let src = source_with_corrupt_member(dir.path());
        let cache = Arc::new(MemCache::new());

        let report = cache_creator(&src, &cache).create(None).unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.written, 3);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("broken.npy"));
    }

    #[test]
    fn test_unreadable_record_skipped_with_filter() {
        let dir = TempDir::new().unwrap();
        let src = source_with_corrupt_member(dir.path());
        let cache = Arc::new(MemCache::new());

        let filter: FilterFn = Arc::new(identity);
        let report = cache_creator(&src, &cache).create(Some(filter)).unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.written, report.total - 1);
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(cache.len(), 3);
    }

    fn panic_on_one(payload: Payload) -> std::result::Result<Payload, Box<dyn StdError + Send + Sync>> {
        if let Payload::Array(array) = &payload {
            if array.data() == &crate::record::ArrayData::I32(vec![1]) {
                panic!("cannot handle this sample");
            }
        }
        Ok(payload)
    }

    #[test]
    fn test_panicking_filter_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        write_source(&src, 4);
        let cache = Arc::new(MemCache::new());

        let filter: FilterFn = Arc::new(panic_on_one);
        let report = cache_creator(&src, &cache).create(Some(filter)).unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, DatasetError::Filter { .. }));
        assert!(!cache.contains("rec001.npy") && !cache.contains("rec001"));
    }

    #[test]
    fn test_multiple_sources_single_group() {
        let dir = TempDir::new().unwrap();
        write_source(&dir.path().join("one"), 3);
        let other: Vec<Record> = (0..4)
            .map(|i| Record::array(format!("other{i}"), NdArray::from_vec(vec![i])))
            .collect();
        DirWriter::new(dir.path().join("two")).write_by_list(&other).unwrap();

        let creator = DatasetCreator::builder()
            .datatype(DataType::Npy)
            .source(SourceSpec::archive(StoreType::Dir, dir.path().join("one")))
            .source(SourceSpec::archive(StoreType::Dir, dir.path().join("two")))
            .destination(StoreType::Tar, dir.path().join("out"))
            .name("merged")
            .config(fast_config())
            .build()
            .unwrap();
        let report = creator.create(None).unwrap();
        assert_eq!(report.written, 7);
        assert_eq!(report.destinations.len(), 1);
        assert!(dir.path().join("out/merged.tar.gz").is_file());
    }

    #[test]
    fn test_empty_source_is_noop() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        let creator = DatasetCreator::builder()
            .datatype(DataType::Npy)
            .source(SourceSpec::archive(StoreType::Dir, dir.path().join("empty")))
            .destination(StoreType::Zip, dir.path().join("out"))
            .name("nothing")
            .build()
            .unwrap();
        let report = creator.create(None).unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(creator.state(), CreatorState::Done);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_builder_validation() {
        let src = SourceSpec::archive(StoreType::Dir, "/tmp");
        assert!(DatasetCreator::builder()
            .source(src.clone())
            .destination(StoreType::Zip, "/tmp/out")
            .build()
            .is_err());
        assert!(DatasetCreator::builder()
            .destination(StoreType::Zip, "/tmp/out")
            .name("x")
            .build()
            .is_err());
        assert!(DatasetCreator::builder()
            .source(src.clone())
            .destination(StoreType::Cifar10Batch, "/tmp/out")
            .name("x")
            .build()
            .is_err());
        assert!(DatasetCreator::builder()
            .source(src)
            .destination(StoreType::Zip, "/tmp/out")
            .name("x")
            .split(SplitManner::ByGroups(0))
            .build()
            .is_err());
    }
}
