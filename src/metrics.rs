use std::borrow::Cow;
use std::time::Duration;

use ::metrics::{Attributes, Counter, Gauge, Histogram, HistogramObservation, Registry, exponential_buckets};

/// 1ms up to about 16s
fn duration_buckets() -> impl Iterator<Item = f64> {
    exponential_buckets(0.001, 2.0, 15)
}

/// What a pipeline did with the records it was given.
///
/// Every series is registered on a registry owned by the pipeline and carries
/// a `pipeline` attribute with its name, so several pipelines can report
/// into one exporter without clashing.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    events_appended: Counter,
    events_dropped: Counter,
    append_errors: Counter,

    batches_encoded: Counter,
    events_encoded: Counter,
    encode_errors: Counter,

    batches_sent: Counter,
    events_sent: Counter,
    bytes_sent: Counter,
    send_errors: Counter,
    retry_errors: Counter,

    unsent_events: Gauge,

    encode_duration: Histogram,
    send_duration: Histogram,
}

/// A point in time copy of the counters of [`PipelineMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub events_appended: u64,
    pub events_dropped: u64,
    pub append_errors: u64,
    pub batches_encoded: u64,
    pub events_encoded: u64,
    pub encode_errors: u64,
    pub batches_sent: u64,
    pub events_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub retry_errors: u64,
    pub unsent_events: i64,
}

impl PipelineMetrics {
    pub fn new(pipeline: &str) -> Self {
        let registry = Registry::new();
        let attrs = || Attributes::from([("pipeline", Cow::Owned(pipeline.to_string()))]);
        let counter = |name, description| registry.register_counter(name, description).recorder(attrs());

        let events_appended = counter("lokiship_events_appended_total", "Records accepted by append.");
        let events_dropped = counter(
            "lokiship_events_dropped_total",
            "Records refused by append or discarded on stop before they were encoded.",
        );
        let append_errors = counter(
            "lokiship_append_errors_total",
            "Records refused by append because they exceed the batch byte limit.",
        );
        let batches_encoded = counter("lokiship_batches_encoded_total", "Batches handed to the send queue.");
        let events_encoded = counter("lokiship_events_encoded_total", "Records in batches handed to the send queue.");
        let encode_errors = counter("lokiship_encode_errors_total", "Batches dropped by the encoder.");
        let batches_sent = counter("lokiship_batches_sent_total", "Batches accepted by the push endpoint.");
        let events_sent = counter("lokiship_events_sent_total", "Records accepted by the push endpoint.");
        let bytes_sent = counter("lokiship_bytes_sent_total", "Encoded bytes accepted by the push endpoint.");
        let send_errors = counter("lokiship_send_errors_total", "Batches given up on by the senders.");
        let retry_errors = counter("lokiship_retry_errors_total", "Failed send attempts that were retried.");

        let unsent_events = registry
            .register_gauge(
                "lokiship_unsent_events",
                "Records accepted by append that were neither sent nor dropped yet.",
            )
            .recorder(attrs());

        let encode_duration = registry
            .register_histogram(
                "lokiship_encode_duration_seconds",
                "Time spent serializing one batch.",
                duration_buckets(),
            )
            .recorder(attrs());
        let send_duration = registry
            .register_histogram(
                "lokiship_send_duration_seconds",
                "Time spent on one push request, retries are observed separately.",
                duration_buckets(),
            )
            .recorder(attrs());

        PipelineMetrics {
            registry,
            events_appended,
            events_dropped,
            append_errors,
            batches_encoded,
            events_encoded,
            encode_errors,
            batches_sent,
            events_sent,
            bytes_sent,
            send_errors,
            retry_errors,
            unsent_events,
            encode_duration,
            send_duration,
        }
    }

    /// The registry holding every series of this pipeline, for exporters.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_appended(&self) {
        self.events_appended.inc(1);
        self.unsent_events.inc(1);
    }

    /// A record refused by `append`, the buffer is full or the pipeline is
    /// stopping.
    pub fn record_dropped(&self) {
        self.events_dropped.inc(1);
    }

    /// A record refused by `append` because it can never fit into a batch.
    pub fn record_append_error(&self) {
        self.append_errors.inc(1);
        self.events_dropped.inc(1);
    }

    /// Accepted records discarded at stop, before they reached the endpoint.
    pub fn record_pending_dropped(&self, events: usize) {
        self.events_dropped.inc(events as u64);
        self.unsent_events.dec(events as i64);
    }

    pub fn record_encoded(&self, events: usize) {
        self.batches_encoded.inc(1);
        self.events_encoded.inc(events as u64);
    }

    pub fn record_encode_error(&self, events: usize) {
        self.encode_errors.inc(1);
        self.unsent_events.dec(events as i64);
    }

    pub fn record_encode_duration(&self, elapsed: Duration) {
        self.encode_duration.record(elapsed.as_secs_f64());
    }

    pub fn record_sent(&self, events: usize, bytes: usize) {
        self.batches_sent.inc(1);
        self.events_sent.inc(events as u64);
        self.bytes_sent.inc(bytes as u64);
        self.unsent_events.dec(events as i64);
    }

    /// A batch given up on, after its last attempt failed.
    pub fn record_send_error(&self, events: usize) {
        self.send_errors.inc(1);
        self.unsent_events.dec(events as i64);
    }

    /// A failed attempt that is about to be retried.
    pub fn record_retry(&self) {
        self.retry_errors.inc(1);
    }

    pub fn record_send_duration(&self, elapsed: Duration) {
        self.send_duration.record(elapsed.as_secs_f64());
    }

    pub fn encode_duration(&self) -> HistogramObservation {
        self.encode_duration.get()
    }

    pub fn send_duration(&self) -> HistogramObservation {
        self.send_duration.get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_appended: self.events_appended.fetch(),
            events_dropped: self.events_dropped.fetch(),
            append_errors: self.append_errors.fetch(),
            batches_encoded: self.batches_encoded.fetch(),
            events_encoded: self.events_encoded.fetch(),
            encode_errors: self.encode_errors.fetch(),
            batches_sent: self.batches_sent.fetch(),
            events_sent: self.events_sent.fetch(),
            bytes_sent: self.bytes_sent.fetch(),
            send_errors: self.send_errors.fetch(),
            retry_errors: self.retry_errors.fetch(),
            unsent_events: self.unsent_events.fetch(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        PipelineMetrics::new("lokiship")
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ::metrics::{Observation, Reporter};

    use super::*;

    #[test]
    fn unsent_follows_lifecycle() {
        let metrics = PipelineMetrics::default();
        for _ in 0..12 {
            metrics.record_appended();
        }
        metrics.record_dropped();
        metrics.record_append_error();

        metrics.record_encoded(6);
        metrics.record_sent(6, 100);
        metrics.record_encode_error(2);
        metrics.record_retry();
        metrics.record_send_error(1);
        metrics.record_pending_dropped(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_appended, 12);
        assert_eq!(snapshot.events_dropped, 4);
        assert_eq!(snapshot.append_errors, 1);
        assert_eq!(snapshot.events_sent, 6);
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.retry_errors, 1);
        assert_eq!(snapshot.unsent_events, 1);
    }

    #[test]
    fn durations() {
        let metrics = PipelineMetrics::default();
        metrics.record_encode_duration(Duration::from_micros(500));
        metrics.record_send_duration(Duration::from_millis(3));
        metrics.record_send_duration(Duration::from_secs(60));

        let encode = metrics.encode_duration();
        assert_eq!(encode.count, 1);
        assert_eq!(encode.buckets[0].count, 1);

        let send = metrics.send_duration();
        assert_eq!(send.count, 2);
        // past the last bound
        assert_eq!(send.buckets.last().map(|b| b.count), Some(1));
    }

    #[derive(Default)]
    struct Series(Vec<(&'static str, String, Observation)>);

    impl Reporter for Series {
        fn start_metric(&mut self, name: &'static str, _description: &'static str) {
            self.0.push((name, String::new(), Observation::Counter(0)));
        }

        fn report(&mut self, attrs: &Attributes, observation: Observation) {
            if let Some(last) = self.0.last_mut() {
                last.1 = attrs.get("pipeline").unwrap_or_default().to_string();
                last.2 = observation;
            }
        }

        fn finish_metric(&mut self) {}
    }

    #[test]
    fn reported_per_pipeline() {
        let metrics = PipelineMetrics::new("audit");
        metrics.record_appended();
        metrics.record_sent(1, 42);

        let mut series = Series::default();
        metrics.registry().report(&mut series);

        let find = |name: &str| {
            series
                .0
                .iter()
                .find(|(n, _, _)| *n == name)
                .map(|(_, pipeline, observation)| (pipeline.clone(), observation.clone()))
                .unwrap()
        };

        assert_eq!(
            find("lokiship_bytes_sent_total"),
            ("audit".to_string(), Observation::Counter(42))
        );
        assert_eq!(
            find("lokiship_unsent_events"),
            ("audit".to_string(), Observation::Gauge(0))
        );
        assert!(matches!(
            find("lokiship_send_duration_seconds").1,
            Observation::Histogram(h) if h.count == 0
        ));
        // every series is registered up front
        assert_eq!(series.0.len(), 14);
    }
}
