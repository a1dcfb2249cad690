// rust/ptfu-core/src/feeder.rs

//! Background minibatch production for training loops.
//!
//! A [`MinibatchFeeder`] walks the names of one or more readers in shuffled
//! epochs, fetches `batch_size` records at a time and keeps a bounded queue of
//! ready batches topped up until it is stopped. Records are labelled on the
//! way out according to a [`LabelStyle`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::archive::ArchiveReader;
use crate::config::PtfuConfig;
use crate::datatype::DataType;
use crate::error::{DatasetError, Result};
use crate::queue::DataQueue;
use crate::record::{Payload, Record};

/// Computes a label from a record name and payload.
pub type LabelFn = Arc<dyn Fn(&str, &Payload) -> Option<i64> + Send + Sync>;

/// How minibatch records get their labels.
#[derive(Clone, Default)]
pub enum LabelStyle {
    /// Keep whatever the decoder or archive stored (TFRecord, CIFAR-10, pickle).
    Stored,
    /// Fill missing labels from the member name, see [`label_from_name`].
    /// Stored labels win.
    #[default]
    ByFilename,
    /// Label every record with a user function. `None` keeps the stored label.
    ByFunc(LabelFn),
}

impl LabelStyle {
    fn apply(&self, mut record: Record) -> Record {
        let label = match self {
            LabelStyle::Stored => None,
            LabelStyle::ByFilename if record.label.is_none() => label_from_name(&record.name),
            LabelStyle::ByFilename => None,
            LabelStyle::ByFunc(func) => func(&record.name, &record.payload),
        };
        if label.is_some() {
            record.label = label;
        }
        record
    }
}

impl fmt::Debug for LabelStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelStyle::Stored => f.write_str("Stored"),
            LabelStyle::ByFilename => f.write_str("ByFilename"),
            LabelStyle::ByFunc(_) => f.write_str("ByFunc(..)"),
        }
    }
}

/// Class label encoded in a member name.
///
/// A numeric parent directory (`"7/img001.png"`) takes precedence; otherwise
/// the leading digits of the file name are used (`"3_cat.png"`, `"00012"`).
pub fn label_from_name(name: &str) -> Option<i64> {
    let mut parts = name.rsplit('/');
    let file = parts.next()?;
    if let Some(label) = parts.next().and_then(|dir| dir.parse().ok()) {
        return Some(label);
    }
    let end = file
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(file.len());
    file[..end].parse().ok()
}

/// Produces shuffled minibatches on a background thread.
pub struct MinibatchFeeder {
    queue: Arc<DataQueue<Vec<Record>>>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    pop_timeout: Duration,
}

impl MinibatchFeeder {
    /// Starts feeding from `readers`, labelling by file name where the records
    /// carry no label of their own.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the readers list no records for
    /// `datatype`, or the error raised while listing them.
    pub fn start(
        readers: Vec<Arc<ArchiveReader>>,
        datatype: DataType,
        config: &PtfuConfig,
    ) -> Result<Self> {
        Self::start_with_labels(readers, datatype, LabelStyle::default(), config)
    }

    /// Like [`start`](Self::start) with an explicit [`LabelStyle`].
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start).
    pub fn start_with_labels(
        readers: Vec<Arc<ArchiveReader>>,
        datatype: DataType,
        labels: LabelStyle,
        config: &PtfuConfig,
    ) -> Result<Self> {
        let mut pool = Vec::new();
        for (index, reader) in readers.iter().enumerate() {
            pool.extend(
                reader
                    .namelist(datatype, true)?
                    .into_iter()
                    .map(|name| (index, name)),
            );
        }
        if pool.is_empty() {
            return Err(DatasetError::config(format!(
                "no {datatype} records to build minibatches from"
            )));
        }

        let batch_size = config.feeder.batch_size.max(1);
        let pop_timeout = config.queue.pop_timeout();
        let queue = Arc::new(
            DataQueue::bounded(-1, config.feeder.capacity).with_pop_timeout(pop_timeout),
        );
        let stop_flag = Arc::new(AtomicBool::new(false));
        let rng = match config.feeder.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        tracing::info!(
            readers = readers.len(),
            records = pool.len(),
            batch_size,
            labels = ?labels,
            "minibatch feeder started"
        );

        let worker = {
            let queue = Arc::clone(&queue);
            let stop_flag = Arc::clone(&stop_flag);
            let mut feed = Feed {
                readers,
                datatype,
                labels,
                pool,
                order: Vec::new(),
                rng,
            };
            thread::spawn(move || {
                'feed: while !stop_flag.load(Ordering::Relaxed) {
                    let Some(mut batch) = feed.next_batch(batch_size) else {
                        tracing::warn!("minibatch feeder stopped: no record could be read");
                        break;
                    };
                    loop {
                        match queue.push_timeout(batch, pop_timeout) {
                            Ok(None) => break,
                            Ok(Some(returned)) => batch = returned,
                            Err(e) => {
                                tracing::warn!(error = %e, "minibatch feeder stopped");
                                break 'feed;
                            }
                        }
                        if stop_flag.load(Ordering::Relaxed) {
                            break 'feed;
                        }
                    }
                }
                tracing::debug!("minibatch feeder exited");
            })
        };

        Ok(Self {
            queue,
            stop_flag,
            worker: Some(worker),
            pop_timeout,
        })
    }

    /// Waits for the next batch. `None` once the feeder has stopped and no
    /// batch is left.
    pub fn next_batch(&self) -> Option<Vec<Record>> {
        loop {
            if let Some(batch) = self.queue.pop_timeout(self.pop_timeout) {
                return Some(batch);
            }
            if !self.is_running() {
                return self.queue.pop();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Batches ready to be taken.
    pub fn ready(&self) -> usize {
        self.queue.qsize()
    }

    /// Signals the worker and waits for it. The batch in progress is
    /// completed first.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MinibatchFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Feed {
    readers: Vec<Arc<ArchiveReader>>,
    datatype: DataType,
    labels: LabelStyle,
    pool: Vec<(usize, String)>,
    order: Vec<(usize, String)>,
    rng: StdRng,
}

impl Feed {
    // None once a whole epoch's worth of reads failed in a row.
    fn next_batch(&mut self, batch_size: usize) -> Option<Vec<Record>> {
        let mut batch = Vec::with_capacity(batch_size);
        let mut failures = 0;
        while batch.len() < batch_size {
            if self.order.is_empty() {
                self.order = self.pool.clone();
                self.order.shuffle(&mut self.rng);
            }
            let (index, name) = self.order.pop()?;
            match self.readers[index].getbyname(&name, self.datatype) {
                Ok(record) => {
                    failures = 0;
                    batch.push(self.labels.apply(record));
                }
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "skipping unreadable record");
                    failures += 1;
                    if failures >= self.pool.len() {
                        return None;
                    }
                }
            }
        }
        Some(batch)
    }
}
