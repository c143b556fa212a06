use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use headers::{Authorization, HeaderMapExt};
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{ConfigBuilderExt, HttpsConnector};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TENANT_HEADER: &str = "x-scope-orgid";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid push url: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("Failed to load native root certificates: {0}")]
    Tls(std::io::Error),
    #[error("Failed to build HTTP request: {0}")]
    BuildRequest(#[from] http::Error),
    #[error("Failed to connect: {0}")]
    Connect(hyper_util::client::legacy::Error),
    #[error("Failed to make HTTP(S) request: {0}")]
    Transport(hyper_util::client::legacy::Error),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to read response: {0}")]
    ReadBody(#[from] hyper::Error),
    #[error("Client is closed")]
    Closed,
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            HttpError::Connect(err)
        } else {
            HttpError::Transport(err)
        }
    }
}

impl HttpError {
    /// Transport level failures, the request may succeed when sent again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HttpError::Connect(_)
                | HttpError::Transport(_)
                | HttpError::Timeout(_)
                | HttpError::ReadBody(_)
        )
    }
}

/// The authentication strategy for push requests
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "strategy")]
pub enum Auth {
    /// Basic authentication, `user:password` encoded with base64.
    Basic { user: String, password: String },

    /// Bearer authentication, the token is passed as-is.
    Bearer { token: String },
}

impl Auth {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn apply_headers_map(&self, map: &mut HeaderMap) {
        match &self {
            Auth::Basic { user, password } => {
                map.typed_insert(Authorization::basic(user, password));
            }
            Auth::Bearer { token } => match Authorization::bearer(token) {
                Ok(auth) => map.typed_insert(auth),
                Err(err) => error!(message = "Invalid bearer token", %err),
            },
        }
    }
}

const fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_idle_per_host() -> usize {
    1
}

const fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_push_url() -> String {
    "http://localhost:3100/loki/api/v1/push".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Loki push endpoint, e.g. `http://localhost:3100/loki/api/v1/push`.
    #[serde(default = "default_push_url")]
    pub push_url: String,

    #[serde(
        default = "default_connection_timeout",
        with = "humanize::duration::serde"
    )]
    pub connection_timeout: Duration,

    /// Bounds a whole request, from sending it to reading the response body.
    #[serde(default = "default_request_timeout", with = "humanize::duration::serde")]
    pub request_timeout: Duration,

    /// Sent as `X-Scope-OrgID` when set.
    #[serde(default)]
    pub tenant_id: Option<String>,

    #[serde(default)]
    pub auth: Option<Auth>,

    /// Filled in from the configured writer.
    #[serde(skip, default = "default_content_type")]
    pub content_type: String,

    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// How long an idle pooled connection is kept alive.
    #[serde(default = "default_idle_timeout", with = "humanize::duration::serde")]
    pub idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            push_url: default_push_url(),
            connection_timeout: default_connection_timeout(),
            request_timeout: default_request_timeout(),
            tenant_id: None,
            auth: None,
            content_type: default_content_type(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// What the push endpoint answered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushResponse {
    pub status: u16,
    pub body: String,
}

impl PushResponse {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Delivers encoded batches to the push endpoint.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Posts `payload` once. The handle is cheap to clone, retrying callers
    /// keep their own copy.
    async fn send(&self, payload: Bytes) -> Result<PushResponse, HttpError>;

    /// Every following `send` fails with [`HttpError::Closed`].
    fn close(&self);

    fn config(&self) -> &HttpConfig;
}

/// A pooled HTTP/1 client over rustls.
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    uri: Uri,
    headers: HeaderMap,
    config: HttpConfig,
    closed: AtomicBool,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("uri", &self.uri)
            .field("closed", &self.closed)
            .finish()
    }
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> Result<HttpClient, HttpError> {
        let uri = config.push_url.parse::<Uri>()?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connection_timeout));

        // native roots are only needed, and only required to exist, for https
        let tls = if uri.scheme_str() == Some("https") {
            ClientConfig::builder()
                .with_native_roots()
                .map_err(HttpError::Tls)?
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth()
        };
        let https = HttpsConnector::from((http, tls));

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(https);

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("lokiship/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(&config.content_type).map_err(http::Error::from)?);
        if let Some(tenant) = &config.tenant_id {
            headers.insert(TENANT_HEADER, HeaderValue::from_str(tenant).map_err(http::Error::from)?);
        }
        if let Some(auth) = &config.auth {
            auth.apply_headers_map(&mut headers);
        }

        Ok(HttpClient {
            client,
            uri,
            headers,
            config,
            closed: AtomicBool::new(false),
        })
    }

    fn build_request(&self, payload: Bytes) -> Result<Request<Full<Bytes>>, HttpError> {
        let mut req = Request::post(self.uri.clone()).body(Full::new(payload))?;
        req.headers_mut().extend(self.headers.clone());

        Ok(req)
    }
}

#[async_trait]
impl PushClient for HttpClient {
    async fn send(&self, payload: Bytes) -> Result<PushResponse, HttpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HttpError::Closed);
        }

        let req = self.build_request(payload)?;
        let fut = async {
            let resp = self.client.request(req).await?;
            let status = resp.status();
            let body = resp.into_body().collect().await?.to_bytes();

            debug!(
                message = "HTTP response received",
                %status,
                body_bytes = body.len()
            );

            Ok::<_, HttpError>(PushResponse {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        };

        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(HttpError::Timeout(self.config.request_timeout)),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn config(&self) -> &HttpConfig {
        &self.config
    }
}
