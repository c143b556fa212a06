mod util;

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use lokiship::writer::proto::PushRequest;
use lokiship::{Auth, LogRecord, LogRecordStream, Pipeline, StreamInterner, WriterKind};
use prost::Message;
use testify::http::{build_test_server, build_test_server_generic, build_test_server_with, drain};
use util::{config, trace_init};

fn json_lines(body: &[u8]) -> Vec<(String, String)> {
    let value: serde_json::Value = serde_json::from_slice(body).unwrap();

    value["streams"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|stream| {
            let app = stream["stream"]["app"].as_str().unwrap().to_string();
            stream["values"]
                .as_array()
                .unwrap()
                .iter()
                .map(move |v| (app.clone(), v[1].as_str().unwrap().to_string()))
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_delivery() {
    trace_init();

    let (addr, mut rx, _server) = build_test_server(StatusCode::NO_CONTENT).await;
    let mut config = config(addr);
    config.http.tenant_id = Some("tenant-1".to_string());
    config.http.auth = Some(Auth::basic("loki", "secret"));

    let pipeline = Pipeline::with_http_client(config).unwrap();
    let interner = StreamInterner::new();
    let web = interner.intern(vec![("app".to_string(), "web".to_string())]);
    let db = interner.intern(vec![("app".to_string(), "db".to_string())]);

    for i in 0..10 {
        let stream = if i % 2 == 0 { &web } else { &db };
        assert!(pipeline.append(LogRecord::new(
            1_700_000_000_000 + i,
            0,
            Arc::clone(stream),
            format!("line {i}"),
        )));
    }

    pipeline.stop().await;

    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);

    let (parts, body) = &received[0];
    assert_eq!(parts.method, http::Method::POST);
    assert_eq!(parts.uri.path(), "/loki/api/v1/push");
    assert_eq!(parts.headers["content-type"], "application/json");
    assert_eq!(parts.headers["x-scope-orgid"], "tenant-1");
    assert_eq!(parts.headers["authorization"], "Basic bG9raTpzZWNyZXQ=");

    let mut lines = json_lines(body);
    assert_eq!(lines.len(), 10);
    lines.sort();
    assert_eq!(lines[0], ("db".to_string(), "line 1".to_string()));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_sent, 10);
    assert_eq!(metrics.batches_sent, 1);
    assert_eq!(metrics.bytes_sent, body.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protobuf_delivery() {
    trace_init();

    let (addr, mut rx, _server) = build_test_server(StatusCode::NO_CONTENT).await;
    let mut config = config(addr);
    config.writer = WriterKind::Protobuf;

    let pipeline = Pipeline::with_http_client(config).unwrap();
    let stream = Arc::new(LogRecordStream::from_pairs(["app", "api", "env", "prod"]));
    pipeline.append(LogRecord::new(1_700_000_000_123, 456, stream, "hello"));

    pipeline.stop().await;

    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);

    let (parts, body) = &received[0];
    assert_eq!(parts.headers["content-type"], "application/x-protobuf");

    let decoded = snap::raw::Decoder::new().decompress_vec(body).unwrap();
    let req = PushRequest::decode(decoded.as_slice()).unwrap();
    assert_eq!(req.streams.len(), 1);
    assert_eq!(req.streams[0].labels, r#"{app="api",env="prod"}"#);

    let entry = &req.streams[0].entries[0];
    assert_eq!(entry.line, "hello");
    let ts = entry.timestamp.clone().unwrap();
    assert_eq!(ts.seconds, 1_700_000_000);
    assert_eq!(ts.nanos, 123_000_456);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_batch_is_retried() {
    trace_init();

    let (addr, mut rx, _server) = build_test_server_generic(|n| {
        let status = if n == 0 {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::NO_CONTENT
        };
        (status, String::new())
    })
    .await;

    let pipeline = Pipeline::with_http_client(config(addr)).unwrap();
    let stream = Arc::new(LogRecordStream::from_pairs(["app", "web"]));
    pipeline.append(LogRecord::new(1, 0, stream, "again"));

    pipeline.stop().await;

    let received = drain(&mut rx);
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].1, received[1].1);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.retry_errors, 1);
    assert_eq!(metrics.batches_sent, 1);
    assert_eq!(metrics.send_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_drops_batch() {
    trace_init();

    let (addr, mut rx, _server) =
        build_test_server_with(StatusCode::BAD_REQUEST, "entry out of order").await;
    let pipeline = Pipeline::with_http_client(config(addr)).unwrap();
    let stream = Arc::new(LogRecordStream::from_pairs(["app", "web"]));
    pipeline.append(LogRecord::new(1, 0, stream, "rejected"));

    pipeline.stop().await;

    assert_eq!(drain(&mut rx).len(), 1);
    let metrics = pipeline.metrics();
    assert_eq!(metrics.send_errors, 1);
    assert_eq!(metrics.unsent_events, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_gives_up() {
    trace_init();

    // bind and release a port so nothing listens on it
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut config = config(addr);
    config.max_retries = 1;
    let pipeline = Pipeline::with_http_client(config).unwrap();
    let stream = Arc::new(LogRecordStream::from_pairs(["app", "web"]));
    pipeline.append(LogRecord::new(1, 0, stream, "lost"));

    pipeline.stop().await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.retry_errors, 1);
    assert_eq!(metrics.send_errors, 1);
    assert_eq!(metrics.events_sent, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_cut_by_count_and_time() {
    trace_init();

    let (addr, mut rx, _server) = build_test_server(StatusCode::NO_CONTENT).await;
    let mut config = config(addr);
    config.batch.max_items = 10;
    config.sender_concurrency = 2;

    let pipeline = Pipeline::with_http_client(config).unwrap();
    let stream = Arc::new(LogRecordStream::from_pairs(["app", "web"]));
    for i in 0..35 {
        pipeline.append(LogRecord::new(i, 0, Arc::clone(&stream), format!("line {i}")));
    }

    // the tail is cut once the batch timeout passes, without stopping
    assert!(pipeline.wait_pipeline_is_empty(Duration::from_secs(5)).await);

    let received = drain(&mut rx);
    let mut sizes = received
        .iter()
        .map(|(_, body)| json_lines(body).len())
        .collect::<Vec<_>>();
    sizes.sort();
    assert_eq!(sizes, vec![5, 10, 10, 10]);

    pipeline.stop().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_cut_by_bytes() {
    trace_init();

    let (addr, mut rx, _server) = build_test_server(StatusCode::NO_CONTENT).await;
    let mut config = config(addr);
    // each record is estimated at 76 + 24 bytes, the stream at 6 + 8, so
    // three records fit and a fourth would not
    config.batch.max_bytes = 350;

    let pipeline = Pipeline::with_http_client(config).unwrap();
    let stream = Arc::new(LogRecordStream::from_pairs(["app", "web"]));
    let message = "x".repeat(76);
    for i in 0..10 {
        assert!(pipeline.append(LogRecord::new(i, 0, Arc::clone(&stream), message.clone())));
    }

    assert!(pipeline.wait_pipeline_is_empty(Duration::from_secs(5)).await);

    let received = drain(&mut rx);
    let mut sizes = received
        .iter()
        .map(|(_, body)| json_lines(body).len())
        .collect::<Vec<_>>();
    sizes.sort();
    // the last record goes out with the time based drain
    assert_eq!(sizes, vec![1, 3, 3, 3]);

    pipeline.stop().await;
    assert_eq!(pipeline.metrics().events_sent, 10);
}
