//! HTTP transport beneath the provider adapters.
//!
//! The transport exposes two operations: a unary request that returns the
//! status, headers, and full body, and a streaming request that delivers
//! UTF-8 chunks to a handler as they arrive.  Provider adapters never touch
//! `reqwest` directly; they speak to the [`Transport`] trait so scenario
//! tests can substitute scripted implementations.
//!
//! A failed streaming attempt is transparently retried as a unary request
//! via [`stream_with_fallback`], replaying the buffered body in simulated
//! chunks so downstream SSE parsers behave exactly as they would against a
//! live stream.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default ceiling for one whole request, streaming or unary.
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Default duration without any chunk before a streaming request is
/// considered stalled.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm,
    /// which matters when five providers are hit in rapid succession.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Errors surfaced by the transport layer.
///
/// Every variant carries a stable machine-readable code (see
/// [`TransportError::code`]) plus a human-readable message via `Display`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("request failed: {0}")]
    FetchRequestFailed(String),

    #[error("stream failed: {0}")]
    FetchStreamFailed(String),

    #[error("request exceeded overall deadline of {0:?}")]
    StreamTimeout(Duration),

    #[error("no chunk received within idle window of {0:?}")]
    StreamIdleTimeout(Duration),

    #[error("request aborted")]
    Aborted,

    #[error("streaming fallback failed: {0}")]
    FallbackFailed(String),
}

impl TransportError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::HttpError { .. } => "HTTP_ERROR",
            TransportError::FetchRequestFailed(_) => "FETCH_REQUEST_FAILED",
            TransportError::FetchStreamFailed(_) => "FETCH_STREAM_FAILED",
            TransportError::StreamTimeout(_) => "STREAM_TIMEOUT",
            TransportError::StreamIdleTimeout(_) => "STREAM_IDLE_TIMEOUT",
            TransportError::Aborted => "ABORTED",
            TransportError::FallbackFailed(_) => "FALLBACK_FAILED",
        }
    }
}

/// Proxy scheme understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    None,
    Http,
    Https,
    Socks5,
    Socks5h,
}

impl ProxyKind {
    fn scheme(&self) -> Option<&'static str> {
        match self {
            ProxyKind::None => None,
            ProxyKind::Http => Some("http"),
            ProxyKind::Https => Some("https"),
            ProxyKind::Socks5 => Some("socks5"),
            ProxyKind::Socks5h => Some("socks5h"),
        }
    }
}

/// A single global proxy configuration applied to every request issued by a
/// transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// A proxy is disabled when its kind is `none`, its host is empty, or
    /// its port falls outside 1..=65535.
    pub fn is_enabled(&self) -> bool {
        self.kind != ProxyKind::None && !self.host.trim().is_empty() && self.port >= 1
    }

    fn url(&self) -> Option<String> {
        let scheme = self.kind.scheme()?;
        Some(format!("{}://{}:{}", scheme, self.host.trim(), self.port))
    }
}

/// One outbound request, unary or streaming.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: reqwest::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub overall_timeout: Duration,
    pub idle_timeout: Duration,
}

impl TransportRequest {
    /// Build a POST request with the default timeouts.
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: reqwest::Method::POST,
            headers: Vec::new(),
            body: None,
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self
    }

    pub fn timeouts(mut self, overall: Duration, idle: Duration) -> Self {
        self.overall_timeout = overall;
        self.idle_timeout = idle;
        self
    }
}

/// Response of a unary request.  Non-2xx statuses are returned, not raised,
/// so callers can inspect error bodies and status families.
#[derive(Debug, Clone)]
pub struct UnaryResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl UnaryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The seam between provider adapters and the HTTP stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a unary request and collect the full body.
    async fn fetch(&self, req: &TransportRequest) -> Result<UnaryResponse, TransportError>;

    /// Issue a streaming request, delivering UTF-8 chunks to `on_chunk`.
    ///
    /// Returns once the stream completes.  Observes `cancel` and returns
    /// [`TransportError::Aborted`] when it fires mid-stream.
    async fn fetch_stream(
        &self,
        req: &TransportRequest,
        on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;
}

/// Incremental UTF-8 decoder that carries incomplete trailing sequences
/// across chunk boundaries so multi-byte characters are never split.
#[derive(Default)]
pub struct Utf8ChunkDecoder {
    carry: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next byte chunk, returning whatever is complete so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);

        match std::str::from_utf8(&buf) {
            Ok(text) => text.to_string(),
            Err(err) if err.error_len().is_none() => {
                // Incomplete trailing sequence: hold it for the next chunk.
                let valid = err.valid_up_to();
                self.carry = buf.split_off(valid);
                String::from_utf8(buf).unwrap_or_default()
            }
            // Genuinely invalid bytes mid-stream; replace rather than stall.
            Err(_) => String::from_utf8_lossy(&buf).into_owned(),
        }
    }
}

/// Production transport backed by `reqwest`.
pub struct HttpTransport {
    proxy: Option<ProxyConfig>,
    client: OnceCell<reqwest::Client>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            proxy: None,
            client: OnceCell::new(),
        }
    }

    pub fn with_proxy(proxy: ProxyConfig) -> Self {
        Self {
            proxy: Some(proxy),
            client: OnceCell::new(),
        }
    }

    /// Resolve the client, constructing the proxied dispatcher at most once.
    fn client(&self) -> Result<&reqwest::Client, TransportError> {
        self.client.get_or_try_init(|| {
            let proxy = self.proxy.as_ref().filter(|p| p.is_enabled());
            let Some(proxy) = proxy else {
                return Ok(SHARED_HTTP_CLIENT.clone());
            };

            let url = proxy
                .url()
                .ok_or_else(|| TransportError::FetchRequestFailed("invalid proxy".into()))?;
            let mut dispatcher = reqwest::Proxy::all(&url)
                .map_err(|e| TransportError::FetchRequestFailed(format!("proxy: {e}")))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                dispatcher = dispatcher.basic_auth(user, pass);
            }

            reqwest::ClientBuilder::new()
                .pool_idle_timeout(Some(Duration::from_secs(90)))
                .connect_timeout(Duration::from_secs(30))
                .proxy(dispatcher)
                .build()
                .map_err(|e| TransportError::FetchRequestFailed(format!("client: {e}")))
        })
    }

    fn builder(&self, req: &TransportRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut builder = self.client()?.request(req.method.clone(), &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, req: &TransportRequest) -> Result<UnaryResponse, TransportError> {
        let builder = self.builder(req)?;

        let send = async {
            let response = builder
                .send()
                .await
                .map_err(|e| TransportError::FetchRequestFailed(e.to_string()))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::FetchRequestFailed(e.to_string()))?;
            Ok(UnaryResponse {
                status,
                headers,
                body,
            })
        };

        tokio::time::timeout(req.overall_timeout, send)
            .await
            .map_err(|_| TransportError::StreamTimeout(req.overall_timeout))?
    }

    async fn fetch_stream(
        &self,
        req: &TransportRequest,
        on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let builder = self.builder(req)?;
        let started = tokio::time::Instant::now();
        let overall_deadline = started + req.overall_timeout;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Aborted),
            sent = tokio::time::timeout(req.overall_timeout, builder.send()) => sent
                .map_err(|_| TransportError::StreamTimeout(req.overall_timeout))?
                .map_err(|e| TransportError::FetchRequestFailed(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut last_chunk_at = tokio::time::Instant::now();

        // One resettable sleep entry covers both the overall deadline and
        // the idle watchdog.
        let deadline_sleep = tokio::time::sleep_until(overall_deadline);
        tokio::pin!(deadline_sleep);

        loop {
            let idle_deadline = last_chunk_at + req.idle_timeout;
            deadline_sleep
                .as_mut()
                .reset(overall_deadline.min(idle_deadline));

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Aborted),
                _ = &mut deadline_sleep => {
                    if tokio::time::Instant::now() >= overall_deadline {
                        return Err(TransportError::StreamTimeout(req.overall_timeout));
                    }
                    return Err(TransportError::StreamIdleTimeout(req.idle_timeout));
                }
                next = stream.next() => match next {
                    Some(Ok(bytes)) => {
                        last_chunk_at = tokio::time::Instant::now();
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            on_chunk(&text);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::FetchStreamFailed(e.to_string()));
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Replay pacing derived from the body length: 24..220 chunks spread over
/// 400..3500 ms with at least 4 ms between chunks.
fn replay_plan(body_len: usize) -> (usize, Duration) {
    let chunks = (body_len / 48).clamp(24, 220);
    let total_ms = ((body_len as u64) * 2).clamp(400, 3500);
    let delay = Duration::from_millis((total_ms / chunks as u64).max(4));
    (chunks, delay)
}

/// Split `body` into `count` chunks without breaking UTF-8 sequences.
fn chunk_utf8(body: &str, count: usize) -> Vec<&str> {
    if body.is_empty() {
        return Vec::new();
    }
    let step = (body.len() / count).max(1);
    let mut chunks = Vec::with_capacity(count);
    let mut start = 0;
    while start < body.len() {
        let mut end = (start + step).min(body.len());
        while !body.is_char_boundary(end) {
            end += 1;
        }
        chunks.push(&body[start..end]);
        start = end;
    }
    chunks
}

/// Streaming with transparent unary fallback.
///
/// If the streaming attempt fails at the network layer before completion,
/// the request is retried unary and the buffered body is replayed to the
/// handler in simulated chunks.  HTTP errors, timeouts, and cancellation are
/// surfaced as-is: an error status must stay visible to the caller, and an
/// external abort never triggers a retry.  `on_fallback` is invoked with the
/// original streaming error when a replay begins.
pub async fn stream_with_fallback(
    transport: &dyn Transport,
    req: &TransportRequest,
    on_chunk: &mut (dyn FnMut(&str) + Send),
    cancel: &CancellationToken,
    on_fallback: Option<&(dyn Fn(&TransportError) + Send + Sync)>,
) -> Result<(), TransportError> {
    let stream_err = match transport.fetch_stream(req, on_chunk, cancel).await {
        Ok(()) => return Ok(()),
        Err(
            err @ (TransportError::FetchRequestFailed(_) | TransportError::FetchStreamFailed(_)),
        ) => err,
        Err(other) => return Err(other),
    };

    if log::log_enabled!(log::Level::Warn) {
        log::warn!(
            "stream_with_fallback: {} ({}); retrying unary",
            stream_err,
            stream_err.code()
        );
    }
    if let Some(callback) = on_fallback {
        callback(&stream_err);
    }

    let response = match transport.fetch(req).await {
        Ok(response) => response,
        Err(TransportError::Aborted) => return Err(TransportError::Aborted),
        Err(e) => return Err(TransportError::FallbackFailed(e.to_string())),
    };
    if !response.is_success() {
        return Err(TransportError::HttpError {
            status: response.status,
            body: response.body,
        });
    }

    let (count, delay) = replay_plan(response.body.len());
    for (index, chunk) in chunk_utf8(&response.body, count).into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        if index > 0 {
            tokio::time::sleep(delay).await;
        }
        on_chunk(chunk);
    }
    Ok(())
}
