// rust/ptfu-core/src/archive/writer.rs

use crate::error::{DatasetError, Result};
use crate::queue::DataQueue;
use crate::record::Record;

/// Result of a batch write: how many records landed and which ones did not.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub processed: usize,
    pub failed: Vec<(String, DatasetError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.processed += other.processed;
        self.failed.extend(other.failed);
    }

    fn record(&mut self, name: &str, result: Result<()>, destination: &str) {
        match result {
            Ok(()) => self.processed += 1,
            Err(e) => {
                tracing::warn!(name, destination, error = %e, "failed to write record");
                self.failed.push((name.to_string(), e));
            }
        }
    }
}

/// Persists records into a destination archive.
///
/// Every batch is bracketed by [`open_dst`](Self::open_dst) and
/// [`close_dst`](Self::close_dst); at most one destination is open at a time.
pub trait ArchiveWriter: Send {
    fn open_dst(&mut self) -> Result<()>;

    fn close_dst(&mut self) -> Result<()>;

    /// Writes one record under `name` into the open destination.
    fn write_record(&mut self, name: &str, record: &Record) -> Result<()>;

    /// Destination used in log and error messages.
    fn destination(&self) -> String;

    /// Writes a single record under `name`, or under `record.name`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::MissingName`] when neither is set.
    fn write(&mut self, record: &Record, name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(&record.name);
        if name.is_empty() {
            return Err(DatasetError::MissingName);
        }
        let dst = OpenGuard::open(self)?;
        dst.writer.write_record(name, record)?;
        dst.finish()
    }

    /// Writes all `records` between one open and one close.
    fn write_by_list(&mut self, records: &[Record]) -> Result<BatchOutcome> {
        let destination = self.destination();
        let dst = OpenGuard::open(self)?;
        let mut outcome = BatchOutcome::default();
        for record in records {
            let result = write_named(&mut *dst.writer, record);
            outcome.record(&record.name, result, &destination);
        }
        dst.finish()?;
        Ok(outcome)
    }

    /// Drains `queue` into the destination until no more items are expected.
    ///
    /// Per-record failures are collected and the loop continues.
    fn write_by_queue(&mut self, queue: &DataQueue<Record>) -> Result<BatchOutcome> {
        let destination = self.destination();
        let timeout = queue.pop_timeout_duration();
        let dst = OpenGuard::open(self)?;
        let mut outcome = BatchOutcome::default();
        while queue.has_next() {
            let Some(record) = queue.pop_timeout(timeout) else {
                continue;
            };
            let result = write_named(&mut *dst.writer, &record);
            outcome.record(&record.name, result, &destination);
        }
        dst.finish()?;
        tracing::debug!(
            destination = %destination,
            processed = outcome.processed,
            failed = outcome.failed.len(),
            "queue drained"
        );
        Ok(outcome)
    }
}

fn write_named<W: ArchiveWriter + ?Sized>(writer: &mut W, record: &Record) -> Result<()> {
    if record.name.is_empty() {
        return Err(DatasetError::MissingName);
    }
    writer.write_record(&record.name, record)
}

// Closes the destination on every exit path, including early returns.
struct OpenGuard<'a, W: ArchiveWriter + ?Sized> {
    writer: &'a mut W,
    open: bool,
}

impl<'a, W: ArchiveWriter + ?Sized> OpenGuard<'a, W> {
    fn open(writer: &'a mut W) -> Result<Self> {
        writer.open_dst()?;
        Ok(Self { writer, open: true })
    }

    fn finish(mut self) -> Result<()> {
        self.open = false;
        self.writer.close_dst()
    }
}

impl<W: ArchiveWriter + ?Sized> Drop for OpenGuard<'_, W> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.writer.close_dst() {
                tracing::warn!(destination = %self.writer.destination(), error = %e, "failed to close destination");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    // Records what happens to it; fails on names starting with "bad".
    #[derive(Default)]
    struct MockWriter {
        opens: usize,
        closes: usize,
        open: bool,
        written: Vec<String>,
    }

    impl ArchiveWriter for MockWriter {
        fn open_dst(&mut self) -> Result<()> {
            assert!(!self.open, "destination opened twice");
            self.opens += 1;
            self.open = true;
            Ok(())
        }

        fn close_dst(&mut self) -> Result<()> {
            self.closes += 1;
            self.open = false;
            Ok(())
        }

        fn write_record(&mut self, name: &str, _record: &Record) -> Result<()> {
            assert!(self.open);
            if name.starts_with("bad") {
                return Err(DatasetError::storage("mock", "rejected"));
            }
            self.written.push(name.to_string());
            Ok(())
        }

        fn destination(&self) -> String {
            "mock".to_string()
        }
    }

    #[test]
    fn test_write_uses_explicit_name() {
        let mut writer = MockWriter::default();
        let record = Record::bytes("inner", b"x".to_vec());
        writer.write(&record, Some("outer")).unwrap();
        writer.write(&record, None).unwrap();

        assert_eq!(writer.written, vec!["outer", "inner"]);
        assert_eq!((writer.opens, writer.closes), (2, 2));
    }

    #[test]
    fn test_write_without_name() {
        let mut writer = MockWriter::default();
        let record = Record::bytes("", b"x".to_vec());
        let result = writer.write(&record, None);
        assert!(matches!(result, Err(DatasetError::MissingName)));
        assert_eq!(writer.opens, 0);
    }

    #[test]
    fn test_write_closes_on_error() {
        let mut writer = MockWriter::default();
        let record = Record::bytes("bad", b"x".to_vec());
        assert!(writer.write(&record, None).is_err());
        assert_eq!((writer.opens, writer.closes), (1, 1));
    }

    #[test]
    fn test_write_by_list_reports_failures() {
        let mut writer = MockWriter::default();
        let records: Vec<Record> = ["a", "bad1", "b"]
            .iter()
            .map(|n| Record::bytes(*n, vec![]))
            .collect();

        let outcome = writer.write_by_list(&records).unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "bad1");
        assert!(!outcome.is_complete());
        assert_eq!((writer.opens, writer.closes), (1, 1));
    }

    #[test]
    fn test_write_by_queue_drains_everything() {
        let queue = Arc::new(DataQueue::new(4).with_pop_timeout(Duration::from_millis(5)));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for name in ["a", "b", "bad", "c"] {
                    queue.push(Record::bytes(name, vec![])).unwrap();
                }
            })
        };

        let mut writer = MockWriter::default();
        let outcome = writer.write_by_queue(&queue).unwrap();
        producer.join().unwrap();

        assert_eq!(writer.written, vec!["a", "b", "c"]);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.failed.len(), 1);
        assert!(!queue.has_next());
        assert_eq!((writer.opens, writer.closes), (1, 1));
    }

    #[test]
    fn test_batch_outcome_merge() {
        let mut a = BatchOutcome {
            processed: 2,
            failed: vec![],
        };
        a.merge(BatchOutcome {
            processed: 1,
            failed: vec![("x".to_string(), DatasetError::MissingName)],
        });
        assert_eq!(a.processed, 3);
        assert_eq!(a.failed.len(), 1);
    }
}
