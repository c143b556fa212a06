use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::error;

use super::{BatchCondition, LogRecordBatch};
use crate::record::{LogRecord, StreamRef};

/// Per item overheads added on top of the raw UTF-8 sizes when estimating
/// how large a batch is once Loki decodes it.
///
/// Loki enforces its receive limit on the uncompressed protobuf message,
/// whatever format the batch was sent in. The defaults are chosen so the
/// estimate never falls below Loki's own accounting.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SizeEstimation {
    /// Added to every record's message.
    pub record_overhead: usize,
    /// Added once for a record carrying any structured metadata.
    pub metadata_overhead: usize,
    /// Added for every metadata pair.
    pub metadata_pair_overhead: usize,
    /// Added for every distinct stream in a batch.
    pub stream_overhead: usize,
}

impl Default for SizeEstimation {
    fn default() -> Self {
        SizeEstimation {
            record_overhead: 24,
            metadata_overhead: 24,
            metadata_pair_overhead: 4,
            stream_overhead: 8,
        }
    }
}

impl SizeEstimation {
    fn record(&self, record: &LogRecord) -> usize {
        let mut size = record.message_utf8_bytes() + self.record_overhead;
        if !record.metadata().is_empty() {
            size += record.metadata_utf8_bytes()
                + self.metadata_overhead
                + record.metadata().len() * self.metadata_pair_overhead;
        }

        size
    }

    fn stream(&self, stream: &StreamRef) -> usize {
        stream.utf8_bytes() + self.stream_overhead
    }
}

/// Splits a stream of records into batches.
///
/// A batch is cut when it reaches `max_items` records (on `add`), when the
/// next record would push its estimated size over `max_size_bytes` (on
/// `check_size_before_add`), or when `max_timeout` passed since the last
/// batch was sent (on `drain`).
///
/// Not thread-safe, owned by the encode task.
#[derive(Debug)]
pub struct Batcher {
    max_items: usize,
    max_size_bytes: usize,
    max_timeout: Duration,
    estimation: SizeEstimation,

    items: Vec<LogRecord>,
    size_bytes: usize,
    streams: HashSet<StreamRef>,

    next_batch_id: u64,
}

impl Batcher {
    pub fn new(max_items: usize, max_size_bytes: usize, max_timeout: Duration) -> Self {
        Self::with_estimation(max_items, max_size_bytes, max_timeout, SizeEstimation::default())
    }

    pub fn with_estimation(
        max_items: usize,
        max_size_bytes: usize,
        max_timeout: Duration,
        estimation: SizeEstimation,
    ) -> Self {
        // ids only have to be unique within a process run, seeding from the
        // clock keeps them distinct across restarts too
        let next_batch_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Batcher {
            max_items,
            max_size_bytes,
            max_timeout,
            estimation,
            items: Vec::with_capacity(max_items),
            size_bytes: 0,
            streams: HashSet::new(),
            next_batch_id,
        }
    }

    /// Whether `record` fits into an otherwise empty batch.
    pub fn validate_record_size(&self, record: &LogRecord) -> bool {
        self.estimation.record(record) + self.estimation.stream(record.stream())
            <= self.max_size_bytes
    }

    /// Cuts the accumulated records into `dest` if `record` would push the
    /// batch over `max_size_bytes`. Never adds `record`.
    pub fn check_size_before_add(&mut self, record: &LogRecord, dest: &mut LogRecordBatch) {
        if self.items.is_empty() {
            return;
        }

        let mut size = self.estimation.record(record);
        if !self.streams.contains(record.stream()) {
            size += self.estimation.stream(record.stream());
        }

        if self.size_bytes + size > self.max_size_bytes {
            self.cut(dest, BatchCondition::MaxBytes);
        }
    }

    /// Adds `record`, cutting into `dest` once `max_items` is reached.
    pub fn add(&mut self, record: LogRecord, dest: &mut LogRecordBatch) {
        self.size_bytes += self.estimation.record(&record);
        if !self.streams.contains(record.stream()) {
            self.size_bytes += self.estimation.stream(record.stream());
            self.streams.insert(Arc::clone(record.stream()));
        }

        self.items.push(record);
        if self.items.len() >= self.max_items {
            self.cut(dest, BatchCondition::MaxItems);
        }
    }

    /// Cuts into `dest` if anything is pending and more than `max_timeout`
    /// passed since `last_sent_ms`.
    pub fn drain(&mut self, last_sent_ms: i64, dest: &mut LogRecordBatch) {
        self.drain_at(last_sent_ms, now_ms(), dest)
    }

    pub fn drain_at(&mut self, last_sent_ms: i64, now_ms: i64, dest: &mut LogRecordBatch) {
        if !self.items.is_empty()
            && now_ms.saturating_sub(last_sent_ms) > self.max_timeout.as_millis() as i64
        {
            self.cut(dest, BatchCondition::Drain);
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_items
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Estimated size of the records accumulated so far.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn cut(&mut self, dest: &mut LogRecordBatch, condition: BatchCondition) {
        let batch_id = self.next_batch_id;
        self.next_batch_id = self.next_batch_id.wrapping_add(1);

        if let Err(err) = dest.init_from(
            &mut self.items,
            self.streams.len(),
            condition,
            self.size_bytes,
            batch_id,
        ) {
            // only reachable when dest was sized below max_items
            error!(message = "Batch cut failed, records dropped", %err);
            self.items.clear();
        }

        self.size_bytes = 0;
        self.streams.clear();
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
