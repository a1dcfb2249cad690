// rust/ptfu-core/src/queue.rs

//! Producer/consumer queue with expected-size accounting.
//!
//! A [`DataQueue`] is shared between one logical producer group and one
//! logical consumer group as an `Arc<DataQueue<T>>`. Besides the items it
//! keeps three counters: the number of items producers intend to push
//! (`expected`, negative for unbounded), the number pushed and the number
//! popped. Consumers keep draining while [`DataQueue::has_next`] holds;
//! producers that fail to deliver an item shrink the expected size so the
//! consumers do not wait for it forever.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{DatasetError, Result};

/// Default time a blocking pop waits before re-checking `has_next`.
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_millis(100);

pub struct DataQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    expected: AtomicI64,
    pushed: AtomicUsize,
    popped: AtomicUsize,
    push_lock: Mutex<()>,
    pop_lock: Mutex<()>,
    pop_timeout: Duration,
}

impl<T> DataQueue<T> {
    /// Unbounded-capacity queue expecting `expected` items (-1 = unbounded).
    pub fn new(expected: i64) -> Self {
        let (tx, rx) = channel::unbounded();
        Self::from_channel(tx, rx, expected)
    }

    /// Queue holding at most `capacity` unpopped items; `push` blocks while full.
    pub fn bounded(expected: i64, capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity.max(1));
        Self::from_channel(tx, rx, expected)
    }

    fn from_channel(tx: Sender<T>, rx: Receiver<T>, expected: i64) -> Self {
        Self {
            tx,
            rx,
            expected: AtomicI64::new(expected),
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
            push_lock: Mutex::new(()),
            pop_lock: Mutex::new(()),
            pop_timeout: DEFAULT_POP_TIMEOUT,
        }
    }

    /// Sets how long `read_all` waits between checks.
    #[must_use]
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn pop_timeout_duration(&self) -> Duration {
        self.pop_timeout
    }

    /// Pushes one item, blocking while a bounded queue is full.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the channel is disconnected.
    pub fn push(&self, item: T) -> Result<()> {
        let _guard = self.push_lock.lock();
        self.push_locked(item)
    }

    fn push_locked(&self, item: T) -> Result<()> {
        // Counted before the send so that popped never exceeds pushed.
        self.pushed.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).map_err(|_| {
            self.pushed.fetch_sub(1, Ordering::SeqCst);
            DatasetError::queue("queue receiver disconnected")
        })
    }

    /// Pushes one item, waiting at most `timeout` for room in a bounded queue.
    ///
    /// Returns the item back when the queue stayed full.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the channel is disconnected.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<Option<T>> {
        let _guard = self.push_lock.lock();
        self.pushed.fetch_add(1, Ordering::SeqCst);
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => Ok(None),
            Err(SendTimeoutError::Timeout(item)) => {
                self.pushed.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(item))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.pushed.fetch_sub(1, Ordering::SeqCst);
                Err(DatasetError::queue("queue receiver disconnected"))
            }
        }
    }

    /// Pushes every item as one contiguous run; other pushes wait.
    pub fn put_all(&self, items: impl IntoIterator<Item = T>) -> Result<()> {
        let _guard = self.push_lock.lock();
        for item in items {
            self.push_locked(item)?;
        }
        Ok(())
    }

    /// Non-blocking pop. `None` when no item is ready or none is expected.
    pub fn pop(&self) -> Option<T> {
        let _guard = self.pop_lock.lock();
        if !self.has_next() {
            return None;
        }
        let item = self.rx.try_recv().ok()?;
        self.popped.fetch_add(1, Ordering::SeqCst);
        Some(item)
    }

    /// Blocking pop with a timeout. `None` on timeout or when none is expected.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let _guard = self.pop_lock.lock();
        self.pop_timeout_locked(timeout)
    }

    fn pop_timeout_locked(&self, timeout: Duration) -> Option<T> {
        if !self.has_next() {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.popped.fetch_add(1, Ordering::SeqCst);
                Some(item)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Collects items until no more are expected, blocking between items.
    /// Other pops wait until it returns.
    ///
    /// Never returns on an unbounded queue.
    pub fn read_all(&self) -> Vec<T> {
        let _guard = self.pop_lock.lock();
        let mut items = Vec::new();
        while self.has_next() {
            if let Some(item) = self.pop_timeout_locked(self.pop_timeout) {
                items.push(item);
            }
        }
        items
    }

    /// True while more items are expected than have been popped.
    pub fn has_next(&self) -> bool {
        let expected = self.expected.load(Ordering::SeqCst);
        expected < 0 || expected as usize > self.popped.load(Ordering::SeqCst)
    }

    /// Expected number of items; -1 when unbounded.
    pub fn datanumber(&self) -> i64 {
        self.expected.load(Ordering::SeqCst)
    }

    /// Replaces the expected number of items.
    pub fn set_expected(&self, expected: i64) {
        self.expected.store(expected, Ordering::SeqCst);
    }

    /// Lowers the expected size by `n`, never below zero. No-op when unbounded.
    pub fn shrink_expected(&self, n: usize) {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let _ = self
            .expected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current >= 0).then(|| current.saturating_sub(n).max(0))
            });
    }

    pub fn pushed_number(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }

    pub fn popped_number(&self) -> usize {
        self.popped.load(Ordering::SeqCst)
    }

    /// Items pushed but not yet popped.
    pub fn qsize(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> std::fmt::Debug for DataQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataQueue")
            .field("expected", &self.datanumber())
            .field("pushed", &self.pushed_number())
            .field("popped", &self.popped_number())
            .field("qsize", &self.qsize())
            .finish()
    }
}
