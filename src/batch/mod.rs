mod batcher;

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

pub(crate) use batcher::now_ms;
pub use batcher::{Batcher, SizeEstimation};

use crate::record::LogRecord;

/// Why a batch was cut.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BatchCondition {
    MaxItems,
    MaxBytes,
    Drain,
    #[default]
    Unknown,
}

impl Display for BatchCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchCondition::MaxItems => "max_items",
            BatchCondition::MaxBytes => "max_bytes",
            BatchCondition::Drain => "drain",
            BatchCondition::Unknown => "unknown",
        };

        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum BatchError {
    #[error("batch capacity exceeded, {len} records do not fit in {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },
}

/// A reusable container of records cut by the [`Batcher`].
///
/// The backing vector is allocated once, `clear` keeps the allocation.
#[derive(Debug)]
pub struct LogRecordBatch {
    records: Vec<LogRecord>,
    capacity: usize,

    batch_id: u64,
    stream_count: usize,
    condition: BatchCondition,
    estimated_size_bytes: usize,
}

impl LogRecordBatch {
    pub fn new(capacity: usize) -> Self {
        LogRecordBatch {
            records: Vec::with_capacity(capacity),
            capacity,
            batch_id: 0,
            stream_count: 0,
            condition: BatchCondition::Unknown,
            estimated_size_bytes: 0,
        }
    }

    /// Moves all of `source` into this batch, leaving `source` empty but
    /// with its allocation intact.
    pub fn init_from(
        &mut self,
        source: &mut Vec<LogRecord>,
        stream_count: usize,
        condition: BatchCondition,
        estimated_size_bytes: usize,
        batch_id: u64,
    ) -> Result<(), BatchError> {
        if source.len() > self.capacity {
            return Err(BatchError::CapacityExceeded {
                len: source.len(),
                capacity: self.capacity,
            });
        }

        self.records.clear();
        self.records.append(source);
        self.batch_id = batch_id;
        self.stream_count = stream_count;
        self.condition = condition;
        self.estimated_size_bytes = estimated_size_bytes;

        Ok(())
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.batch_id = 0;
        self.stream_count = 0;
        self.condition = BatchCondition::Unknown;
        self.estimated_size_bytes = 0;
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&LogRecord> {
        self.records.get(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Stable sort, records comparing equal keep their arrival order.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&LogRecord, &LogRecord) -> Ordering,
    {
        self.records.sort_by(compare)
    }

    #[inline]
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    #[inline]
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    #[inline]
    pub fn condition(&self) -> BatchCondition {
        self.condition
    }

    #[inline]
    pub fn estimated_size_bytes(&self) -> usize {
        self.estimated_size_bytes
    }
}

impl<'a> IntoIterator for &'a LogRecordBatch {
    type Item = &'a LogRecord;
    type IntoIter = std::slice::Iter<'a, LogRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl Display for LogRecordBatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{:x} ({}, {} records, {} streams, est. size {} bytes)",
            self.batch_id,
            self.condition,
            self.records.len(),
            self.stream_count,
            self.estimated_size_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::record::LogRecordStream;

    fn records(n: usize) -> Vec<LogRecord> {
        let stream = Arc::new(LogRecordStream::from_pairs(["app", "test"]));
        (0..n)
            .map(|i| LogRecord::new(i as i64, 0, Arc::clone(&stream), format!("line {i}")))
            .collect()
    }

    #[test]
    fn init_and_clear() {
        let mut batch = LogRecordBatch::new(4);
        assert!(batch.is_empty());

        let mut source = records(3);
        batch
            .init_from(&mut source, 1, BatchCondition::Drain, 120, 0xabc)
            .unwrap();

        assert!(source.is_empty());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.get(2).unwrap().message(), "line 2");
        assert!(batch.get(3).is_none());
        assert_eq!(batch.batch_id(), 0xabc);
        assert_eq!(batch.condition(), BatchCondition::Drain);
        assert_eq!(
            batch.to_string(),
            "#abc (drain, 3 records, 1 streams, est. size 120 bytes)"
        );

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.condition(), BatchCondition::Unknown);
        assert_eq!(batch.capacity(), 4);
    }

    #[test]
    fn capacity_exceeded() {
        let mut batch = LogRecordBatch::new(2);
        let mut source = records(3);

        assert_eq!(
            batch.init_from(&mut source, 1, BatchCondition::MaxItems, 0, 1),
            Err(BatchError::CapacityExceeded {
                len: 3,
                capacity: 2
            })
        );
        assert_eq!(source.len(), 3);
        assert!(batch.is_empty());
    }

    #[test]
    fn sort_is_stable() {
        let a = Arc::new(LogRecordStream::from_pairs(["app", "a"]));
        let b = Arc::new(LogRecordStream::from_pairs(["app", "b"]));
        let mut source = vec![
            LogRecord::new(3, 0, Arc::clone(&b), "b1"),
            LogRecord::new(1, 0, Arc::clone(&a), "a1"),
            LogRecord::new(2, 0, Arc::clone(&b), "b2"),
            LogRecord::new(0, 0, Arc::clone(&a), "a2"),
        ];

        let mut batch = LogRecordBatch::new(4);
        batch
            .init_from(&mut source, 2, BatchCondition::MaxItems, 0, 1)
            .unwrap();
        batch.sort_by(|x, y| x.stream().labels().cmp(y.stream().labels()));

        let messages = batch.iter().map(|r| r.message()).collect::<Vec<_>>();
        assert_eq!(messages, ["a1", "a2", "b1", "b2"]);
    }
}
