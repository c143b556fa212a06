use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use ::metrics::Registry;
use backoff::{ExponentialBackoff, Jitter};
use buffer::{BinaryBatch, BinaryBatchQueue, IngestReceiver, IngestSender, ingest};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::batch::now_ms;
use crate::batch::{Batcher, LogRecordBatch};
use crate::config::{ConfigError, PipelineConfig};
use crate::http::{HttpClient, PushClient};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::record::LogRecord;
use crate::trace::payload_preview;
use crate::writer::{Writer, WriterKind};

const TOO_MANY_REQUESTS: u16 = 429;

struct Inner {
    config: PipelineConfig,

    sender: IngestSender<LogRecord>,
    send_queue: BinaryBatchQueue,
    client: Arc<dyn PushClient>,
    metrics: Arc<PipelineMetrics>,

    // only used to validate record sizes on append, never holds records
    validator: Batcher,

    stopping: AtomicBool,
    force_drain: AtomicBool,
    drain_requested: Notify,
    last_sent_ms: AtomicI64,
    in_flight: AtomicUsize,

    shutdown: CancellationToken,
}

/// Ships log records to a Loki push endpoint.
///
/// Records appended from any thread are buffered, cut into batches, encoded
/// and sent by tasks running on the tokio runtime the pipeline was started
/// on. Delivery failures never reach the producer, they show up in logs and
/// [`PipelineMetrics`].
pub struct Pipeline {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Starts the encode and send tasks. Must be called within a tokio
    /// runtime.
    pub fn start(config: PipelineConfig, client: Arc<dyn PushClient>) -> Result<Pipeline, ConfigError> {
        config.validate()?;

        let (sender, receiver) = ingest(config.buffer_capacity);
        let validator = Batcher::with_estimation(
            1,
            config.batch.max_bytes,
            config.batch.timeout,
            config.size_estimation,
        );

        let inner = Arc::new(Inner {
            sender,
            send_queue: BinaryBatchQueue::new(config.send_queue_max_bytes),
            client,
            metrics: Arc::new(PipelineMetrics::new(&config.name)),
            validator,
            stopping: AtomicBool::new(false),
            force_drain: AtomicBool::new(false),
            drain_requested: Notify::new(),
            last_sent_ms: AtomicI64::new(now_ms()),
            in_flight: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            config,
        });

        let span = info_span!("pipeline", name = %inner.config.name);
        let mut tasks = Vec::with_capacity(inner.config.sender_concurrency + 1);
        tasks.push(tokio::spawn(
            encode_loop(Arc::clone(&inner), receiver)
                .instrument(info_span!(parent: &span, "encoder")),
        ));
        for id in 0..inner.config.sender_concurrency {
            tasks.push(tokio::spawn(
                send_loop(Arc::clone(&inner)).instrument(info_span!(parent: &span, "sender", id)),
            ));
        }

        span.in_scope(|| {
            info!(
                message = "Pipeline started",
                push_url = %inner.config.http.push_url,
                writer = ?inner.config.writer,
                senders = inner.config.sender_concurrency,
            )
        });

        Ok(Pipeline {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    /// Starts a pipeline delivering with an [`HttpClient`] built from
    /// `config.http`.
    pub fn with_http_client(config: PipelineConfig) -> crate::Result<Pipeline> {
        config.validate()?;
        let client = HttpClient::new(config.client_config())?;

        Ok(Pipeline::start(config, Arc::new(client))?)
    }

    /// Queues `record` for delivery, never blocks.
    ///
    /// Returns false when the record was dropped: the pipeline is stopping,
    /// the record alone exceeds `batch.max_bytes`, or the buffer is full.
    pub fn append(&self, record: LogRecord) -> bool {
        let inner = &self.inner;

        if inner.stopping.load(Ordering::Acquire) {
            inner.metrics.record_dropped();
            return false;
        }

        if !inner.validator.validate_record_size(&record) {
            warn!(
                message = "Dropping record larger than batch max bytes",
                pipeline = %inner.config.name,
                message_bytes = record.message_utf8_bytes(),
                max_bytes = inner.config.batch.max_bytes,
            );
            inner.metrics.record_append_error();
            return false;
        }

        match inner.sender.offer(record) {
            Ok(()) => {
                inner.metrics.record_appended();
                true
            }
            Err(_record) => {
                trace!(
                    message = "Dropping record, buffer is full",
                    pipeline = %inner.config.name,
                    capacity = inner.sender.capacity(),
                );
                inner.metrics.record_dropped();
                false
            }
        }
    }

    /// Stops accepting records, flushes what is pending when `drain_on_stop`
    /// is set (bounded by `shutdown_timeout`), then stops all tasks and closes
    /// the client.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(message = "Stopping pipeline", pipeline = %inner.config.name);
        inner.sender.close();

        if inner.config.drain_on_stop {
            inner.force_drain.store(true, Ordering::Release);
            inner.drain_requested.notify_one();

            if !self.wait_pipeline_is_empty(inner.config.shutdown_timeout).await {
                warn!(
                    message = "Pipeline is not empty after shutdown timeout, pending records are dropped",
                    pipeline = %inner.config.name,
                    timeout = ?inner.config.shutdown_timeout,
                    pending = inner.sender.occupied(),
                    queued_batches = inner.send_queue.len(),
                );
            }
        }

        inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(message = "Pipeline task failed", %err);
            }
        }

        while let Some(batch) = inner.send_queue.borrow() {
            warn!(
                message = "Dropping batch left in the send queue",
                batch_id = %format!("{:x}", batch.batch_id),
                items = batch.size_items,
            );
            inner.metrics.record_pending_dropped(batch.size_items);
        }

        inner.client.close();
        info!(message = "Pipeline stopped", pipeline = %inner.config.name);
    }

    /// Waits until every appended record was sent or dropped. Returns false
    /// when `timeout` passed first.
    pub async fn wait_pipeline_is_empty(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;

        loop {
            if inner.is_empty() {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(inner.config.internal_queues_check_timeout).await;
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Every metric series of this pipeline, labeled with its name.
    pub fn registry(&self) -> &Registry {
        self.inner.metrics.registry()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn is_empty(&self) -> bool {
        // records stay occupied until their batch is in the send queue, and
        // senders count themselves in flight before taking a batch out, so
        // there is no window where work is invisible to all three checks
        self.sender.occupied() == 0
            && self.send_queue.is_empty()
            && self.in_flight.load(Ordering::Acquire) == 0
    }

    fn sort(&self, batch: &mut LogRecordBatch) {
        if self.config.static_labels {
            return;
        }

        if self.config.sort_by_time {
            batch.sort_by(|a, b| {
                compare_streams(a, b)
                    .then(a.timestamp_ms().cmp(&b.timestamp_ms()))
                    .then(a.nanos_in_ms().cmp(&b.nanos_in_ms()))
            });
        } else {
            batch.sort_by(compare_streams);
        }
    }

    /// Encodes `batch`, hands it to the send queue and releases its records
    /// from the ingestion buffer.
    async fn flush(
        &self,
        batch: &mut LogRecordBatch,
        writer: &mut Box<dyn Writer>,
        receiver: &IngestReceiver<LogRecord>,
    ) {
        let items = batch.len();
        self.sort(batch);

        let start = Instant::now();
        let encoded = writer.serialize_batch(batch);
        self.metrics.record_encode_duration(start.elapsed());

        match encoded {
            Ok(()) if writer.size() > self.send_queue.max_bytes() => {
                // the send queue could never take it
                error!(
                    message = "Encoded batch is larger than the send queue, dropping it",
                    batch = %batch,
                    encoded_bytes = writer.size(),
                    max_bytes = self.send_queue.max_bytes(),
                );
                writer.reset();
                self.metrics.record_encode_error(items);
            }
            Ok(()) => {
                let size = writer.size();
                trace!(message = "Batch encoded", batch = %batch, encoded_bytes = size);

                loop {
                    if self
                        .send_queue
                        .offer(batch.batch_id(), items, size, |buf| writer.to_buffer(buf))
                    {
                        self.metrics.record_encoded(items);
                        break;
                    }

                    if self.shutdown.is_cancelled() {
                        warn!(message = "Dropping batch, pipeline is shut down", batch = %batch);
                        writer.reset();
                        self.metrics.record_send_error(items);
                        break;
                    }

                    // send queue is full
                    tokio::time::sleep(self.config.internal_queues_check_timeout).await;
                }
            }
            Err(err) => {
                error!(message = "Failed to encode batch, dropping it", batch = %batch, %err);
                writer.reset();
                self.metrics.record_encode_error(items);
            }
        }

        receiver.commit(items);
        batch.clear();
    }

    async fn send_batch(&self, mut batch: BinaryBatch, backoff: &mut ExponentialBackoff, jitter: &Jitter) {
        let payload = batch.take_payload();
        let batch_id = format!("{:x}", batch.batch_id);

        if self.config.trace_payloads {
            trace!(
                message = "Sending batch",
                %batch_id,
                payload = %payload_preview(&payload, self.config.writer == WriterKind::Protobuf),
            );
        }

        let mut attempts = 0;
        loop {
            let start = Instant::now();
            let result = self.client.send(payload.clone()).await;
            self.metrics.record_send_duration(start.elapsed());

            let retry = match result {
                Ok(resp) if resp.is_success() => {
                    debug!(
                        message = "Batch sent",
                        %batch_id,
                        items = batch.size_items,
                        bytes = batch.size_bytes,
                    );
                    self.metrics.record_sent(batch.size_items, batch.size_bytes);
                    self.last_sent_ms.store(now_ms(), Ordering::Release);
                    false
                }
                Ok(resp)
                    if resp.status == TOO_MANY_REQUESTS
                        && !self.config.drop_rate_limited_batches =>
                {
                    warn!(message = "Batch rate limited", %batch_id, body = %resp.body);
                    true
                }
                Ok(resp) => {
                    error!(
                        message = "Batch rejected, dropping it",
                        %batch_id,
                        status = resp.status,
                        body = %resp.body,
                    );
                    self.metrics.record_send_error(batch.size_items);
                    false
                }
                Err(err) if err.is_retriable() => {
                    warn!(message = "Failed to send batch", %batch_id, %err);
                    true
                }
                Err(err) => {
                    error!(message = "Failed to send batch, dropping it", %batch_id, %err);
                    self.metrics.record_send_error(batch.size_items);
                    false
                }
            };

            if !retry {
                break;
            }

            if attempts >= self.config.max_retries {
                error!(
                    message = "Retries exhausted, dropping batch",
                    %batch_id,
                    attempts = attempts + 1,
                );
                self.metrics.record_send_error(batch.size_items);
                break;
            }

            attempts += 1;
            self.metrics.record_retry();

            let delay = backoff.next_delay() + jitter.next_jitter();
            debug!(message = "Retrying batch", %batch_id, attempt = attempts, ?delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = self.shutdown.cancelled() => {
                    warn!(message = "Dropping batch being retried, pipeline is shut down", %batch_id);
                    self.metrics.record_send_error(batch.size_items);
                    break;
                }
            }
        }

        backoff.reset();
        batch.reclaim(payload);
        self.send_queue.return_buffer(batch);
    }
}

fn compare_streams(a: &LogRecord, b: &LogRecord) -> CmpOrdering {
    let (a, b) = (a.stream(), b.stream());
    if Arc::ptr_eq(a, b) {
        return CmpOrdering::Equal;
    }

    a.hash_code()
        .cmp(&b.hash_code())
        .then_with(|| a.labels().cmp(b.labels()))
}

async fn encode_loop(inner: Arc<Inner>, mut receiver: IngestReceiver<LogRecord>) {
    let config = &inner.config;
    let mut batcher = Batcher::with_estimation(
        config.batch.max_items,
        config.batch.max_bytes,
        config.batch.timeout,
        config.size_estimation,
    );
    let mut batch = LogRecordBatch::new(config.batch.max_items);
    let mut writer = config.writer.build(config.batch.max_bytes);

    let mut ticker = tokio::time::interval(config.drain_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(message = "Encoder started");

    loop {
        while let Some(record) = receiver.peek() {
            batcher.check_size_before_add(record, &mut batch);
            if !batch.is_empty() {
                inner.flush(&mut batch, &mut writer, &receiver).await;
            }

            let Some(record) = receiver.poll() else {
                break;
            };
            batcher.add(record, &mut batch);
            if !batch.is_empty() {
                inner.flush(&mut batch, &mut writer, &receiver).await;
            }
        }

        let last_sent_ms = if inner.force_drain.load(Ordering::Acquire) {
            0
        } else {
            inner.last_sent_ms.load(Ordering::Acquire)
        };
        batcher.drain(last_sent_ms, &mut batch);
        if !batch.is_empty() {
            inner.flush(&mut batch, &mut writer, &receiver).await;
        }

        // a closed buffer is always ready, stop waiting on it
        let closed = receiver.is_closed();
        tokio::select! {
            _ = receiver.ready(), if !closed => {},
            _ = ticker.tick() => {},
            _ = inner.drain_requested.notified() => {},
            _ = inner.shutdown.cancelled() => break,
        }
    }

    // slots stay occupied until their batch is flushed, this covers the
    // batcher and whatever was never polled
    let pending = receiver.occupied();
    if pending > 0 {
        warn!(message = "Encoder stopped with pending records, dropping them", pending);
        inner.metrics.record_pending_dropped(pending);
    }
    debug!(message = "Encoder stopped");
}

async fn send_loop(inner: Arc<Inner>) {
    let config = &inner.config;
    let mut backoff = ExponentialBackoff::new(config.min_retry_backoff, config.max_retry_backoff);
    let jitter = Jitter::new(config.max_retry_jitter);

    debug!(message = "Sender started");

    loop {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        match inner.send_queue.borrow() {
            Some(batch) => {
                inner.send_batch(batch, &mut backoff, &jitter).await;
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);

                tokio::select! {
                    _ = inner.send_queue.notified() => {},
                    _ = tokio::time::sleep(config.internal_queues_check_timeout) => {},
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }
    }

    debug!(message = "Sender stopped");
}
