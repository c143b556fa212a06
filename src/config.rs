use std::time::Duration;

use http::Uri;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::SizeEstimation;
use crate::http::HttpConfig;
use crate::writer::WriterKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config failed, {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid batch config, {0}")]
    InvalidBatch(&'static str),
    #[error("invalid retry backoff, {0}")]
    InvalidBackoff(&'static str),
    #[error("invalid queue config, {0}")]
    InvalidQueue(&'static str),
    #[error("invalid push url {url:?}, {err}")]
    InvalidUrl {
        url: String,
        err: http::uri::InvalidUri,
    },
}

const fn default_max_items() -> usize {
    1000
}

const fn default_max_bytes() -> usize {
    4 * 1024 * 1024
}

const fn default_batch_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configures how records are cut into batches.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// The maximum records of a batch, before it is flushed.
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// The maximum estimated size of a batch, before it is flushed. Loki
    /// rejects pushes over `grpc_server_max_recv_msg_size`, 4M by default.
    #[serde(default = "default_max_bytes", with = "humanize::bytes::serde")]
    pub max_bytes: usize,

    /// The maximum age of pending records before they are flushed.
    #[serde(default = "default_batch_timeout", with = "humanize::duration::serde")]
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_items: default_max_items(),
            max_bytes: default_max_bytes(),
            timeout: default_batch_timeout(),
        }
    }
}

fn default_name() -> String {
    "lokiship".to_string()
}

const fn default_send_queue_max_bytes() -> usize {
    40 * 1024 * 1024
}

const fn default_max_retries() -> usize {
    2
}

const fn default_min_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

const fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_retry_jitter() -> Duration {
    Duration::from_millis(500)
}

const fn default_internal_queues_check_timeout() -> Duration {
    Duration::from_millis(25)
}

const fn default_drain_check_interval() -> Duration {
    Duration::from_millis(100)
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_buffer_capacity() -> usize {
    100_000
}

const fn default_sender_concurrency() -> usize {
    1
}

const fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Attached to every log line the pipeline emits.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Sort records of a batch by stream and then by timestamp.
    #[serde(default)]
    pub sort_by_time: bool,

    /// All records share one label set, grouping them is skipped.
    #[serde(default)]
    pub static_labels: bool,

    /// Bounds the encoded batches waiting to be sent.
    #[serde(
        default = "default_send_queue_max_bytes",
        with = "humanize::bytes::serde"
    )]
    pub send_queue_max_bytes: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(
        default = "default_min_retry_backoff",
        with = "humanize::duration::serde"
    )]
    pub min_retry_backoff: Duration,

    #[serde(
        default = "default_max_retry_backoff",
        with = "humanize::duration::serde"
    )]
    pub max_retry_backoff: Duration,

    /// Random delay added on top of every backoff, zero disables it.
    #[serde(
        default = "default_max_retry_jitter",
        with = "humanize::duration::serde"
    )]
    pub max_retry_jitter: Duration,

    /// Give up on a batch rejected with 429 instead of retrying it.
    #[serde(default)]
    pub drop_rate_limited_batches: bool,

    /// How long the encoder waits for room in the send queue before checking
    /// again.
    #[serde(
        default = "default_internal_queues_check_timeout",
        with = "humanize::duration::serde"
    )]
    pub internal_queues_check_timeout: Duration,

    #[serde(
        default = "default_drain_check_interval",
        with = "humanize::duration::serde"
    )]
    pub drain_check_interval: Duration,

    /// Flush everything pending before `stop` returns.
    #[serde(default = "default_true")]
    pub drain_on_stop: bool,

    /// Upper bound for draining on stop.
    #[serde(
        default = "default_shutdown_timeout",
        with = "humanize::duration::serde"
    )]
    pub shutdown_timeout: Duration,

    /// Maximum records waiting to be batched.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Number of concurrent send tasks.
    #[serde(default = "default_sender_concurrency")]
    pub sender_concurrency: usize,

    #[serde(default)]
    pub size_estimation: SizeEstimation,

    #[serde(default)]
    pub writer: WriterKind,

    #[serde(default)]
    pub http: HttpConfig,

    /// Dump every payload at trace level.
    #[serde(default)]
    pub trace_payloads: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            name: default_name(),
            batch: BatchConfig::default(),
            sort_by_time: false,
            static_labels: false,
            send_queue_max_bytes: default_send_queue_max_bytes(),
            max_retries: default_max_retries(),
            min_retry_backoff: default_min_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
            max_retry_jitter: default_max_retry_jitter(),
            drop_rate_limited_batches: false,
            internal_queues_check_timeout: default_internal_queues_check_timeout(),
            drain_check_interval: default_drain_check_interval(),
            drain_on_stop: true,
            shutdown_timeout: default_shutdown_timeout(),
            buffer_capacity: default_buffer_capacity(),
            sender_concurrency: default_sender_concurrency(),
            size_estimation: SizeEstimation::default(),
            writer: WriterKind::default(),
            http: HttpConfig::default(),
            trace_payloads: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<PipelineConfig, ConfigError> {
        let config = serde_yaml::from_str::<PipelineConfig>(text)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_items == 0 {
            return Err(ConfigError::InvalidBatch("max_items must be greater than 0"));
        }
        if self.batch.max_bytes == 0 {
            return Err(ConfigError::InvalidBatch("max_bytes must be greater than 0"));
        }

        if self.min_retry_backoff > self.max_retry_backoff {
            return Err(ConfigError::InvalidBackoff(
                "min_retry_backoff must not be greater than max_retry_backoff",
            ));
        }

        if self.send_queue_max_bytes < self.batch.max_bytes {
            return Err(ConfigError::InvalidQueue(
                "send_queue_max_bytes must not be less than batch.max_bytes",
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::InvalidQueue(
                "buffer_capacity must be greater than 0",
            ));
        }
        if self.sender_concurrency == 0 {
            return Err(ConfigError::InvalidQueue(
                "sender_concurrency must be greater than 0",
            ));
        }
        if self.internal_queues_check_timeout.is_zero() || self.drain_check_interval.is_zero() {
            return Err(ConfigError::InvalidQueue(
                "internal_queues_check_timeout and drain_check_interval must be greater than 0",
            ));
        }

        if let Err(err) = self.http.push_url.parse::<Uri>() {
            return Err(ConfigError::InvalidUrl {
                url: self.http.push_url.clone(),
                err,
            });
        }

        Ok(())
    }

    /// The client config with the content type of the configured writer.
    pub fn client_config(&self) -> HttpConfig {
        HttpConfig {
            content_type: self.writer.content_type().to_string(),
            ..self.http.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PipelineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.batch.max_items, 1000);
        assert_eq!(config.batch.max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.max_retries, 2);
        assert!(config.drain_on_stop);
        assert_eq!(config.writer, WriterKind::Json);
    }

    #[test]
    fn full() {
        let config = PipelineConfig::from_yaml(
            r#"
name: app-logs
batch:
  max_items: 500
  max_bytes: 1MiB
  timeout: 5s
sort_by_time: true
send_queue_max_bytes: 10MiB
max_retries: 5
min_retry_backoff: 100ms
max_retry_backoff: 10s
drop_rate_limited_batches: true
writer: protobuf
size_estimation:
  record_overhead: 32
http:
  push_url: http://loki:3100/loki/api/v1/push
  tenant_id: tenant-a
"#,
        )
        .unwrap();

        assert_eq!(config.name, "app-logs");
        assert_eq!(config.batch.max_items, 500);
        assert_eq!(config.batch.max_bytes, 1024 * 1024);
        assert_eq!(config.batch.timeout, Duration::from_secs(5));
        assert_eq!(config.min_retry_backoff, Duration::from_millis(100));
        assert_eq!(config.size_estimation.record_overhead, 32);
        assert_eq!(config.size_estimation.stream_overhead, 8);
        assert_eq!(config.http.tenant_id.as_deref(), Some("tenant-a"));

        let client = config.client_config();
        assert_eq!(client.content_type, "application/x-protobuf");
        assert_eq!(client.push_url, "http://loki:3100/loki/api/v1/push");
    }

    #[test]
    fn invalid() {
        let cases = [
            "batch:\n  max_items: 0",
            "min_retry_backoff: 10s\nmax_retry_backoff: 1s",
            "send_queue_max_bytes: 1KiB",
            "sender_concurrency: 0",
            "http:\n  push_url: 'http://exa mple'",
        ];

        for case in cases {
            assert!(PipelineConfig::from_yaml(case).is_err(), "{case}");
        }

        assert!(matches!(
            PipelineConfig::from_yaml("unknown: 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
