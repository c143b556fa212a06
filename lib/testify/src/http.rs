use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Received = mpsc::UnboundedReceiver<(Parts, Bytes)>;

/// Answers every request with `status` and an empty body.
pub async fn build_test_server(status: StatusCode) -> (SocketAddr, Received, JoinHandle<()>) {
    build_test_server_generic(move |_| (status, String::new())).await
}

pub async fn build_test_server_with(
    status: StatusCode,
    body: &str,
) -> (SocketAddr, Received, JoinHandle<()>) {
    let body = body.to_string();
    build_test_server_generic(move |_| (status, body.clone())).await
}

/// Serves the nth request (counting from 0) with `responder(n)`, and
/// forwards the request head and body to the returned receiver.
pub async fn build_test_server_generic(
    responder: impl Fn(usize) -> (StatusCode, String) + Clone + Send + Sync + 'static,
) -> (SocketAddr, Received, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let seen = Arc::new(AtomicUsize::new(0));

    let handle = tokio::spawn(async move {
        loop {
            let Ok((conn, _peer)) = listener.accept().await else {
                continue;
            };

            let responder = responder.clone();
            let tx = tx.clone();
            let seen = Arc::clone(&seen);
            let service = service_fn(move |req: Request<Incoming>| {
                let responder = responder.clone();
                let tx = tx.clone();
                let seen = Arc::clone(&seen);

                async move {
                    let (parts, incoming) = req.into_parts();
                    let data = incoming.collect().await?.to_bytes();
                    let _ = tx.send((parts, data));

                    let (status, body) = responder(seen.fetch_add(1, Ordering::SeqCst));
                    let resp = Response::builder()
                        .status(status)
                        .body(Full::new(Bytes::from(body)))
                        .unwrap();

                    Ok::<_, hyper::Error>(resp)
                }
            });

            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(conn), service)
                    .await
                {
                    tracing::warn!(message = "failed to serve connection", ?err);
                }
            });
        }
    });

    (addr, rx, handle)
}

/// Takes whatever requests arrived so far, without waiting.
pub fn drain(rx: &mut Received) -> Vec<(Parts, Bytes)> {
    let mut received = vec![];
    while let Ok(item) = rx.try_recv() {
        received.push(item);
    }

    received
}
