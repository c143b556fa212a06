use std::net::SocketAddr;
use std::time::Duration;

use lokiship::{BatchConfig, PipelineConfig};

pub fn trace_init() {
    let level = std::env::var("TEST_LOG").unwrap_or_else(|_| "info".to_string());
    lokiship::trace::init(&level);
}

/// A config tuned for fast tests, pushing to `addr`.
pub fn config(addr: SocketAddr) -> PipelineConfig {
    let mut config = PipelineConfig {
        name: "integration".to_string(),
        batch: BatchConfig {
            max_items: 100,
            max_bytes: 64 * 1024,
            timeout: Duration::from_millis(100),
        },
        send_queue_max_bytes: 1024 * 1024,
        min_retry_backoff: Duration::from_millis(5),
        max_retry_backoff: Duration::from_millis(20),
        max_retry_jitter: Duration::ZERO,
        internal_queues_check_timeout: Duration::from_millis(5),
        drain_check_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    config.http.push_url = format!("http://{addr}/loki/api/v1/push");
    config.http.request_timeout = Duration::from_secs(2);

    config
}
