//! Streaming fallback behaviour at the transport seam.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use socratic_council::council::transport::{
    stream_with_fallback, Transport, TransportError, TransportRequest, UnaryResponse,
};
use tokio_util::sync::CancellationToken;

/// Fails the streaming attempt, succeeds on the unary retry.
struct FlakyTransport {
    unary_body: String,
    stream_attempts: AtomicUsize,
    unary_attempts: AtomicUsize,
}

impl FlakyTransport {
    fn new(unary_body: &str) -> Self {
        Self {
            unary_body: unary_body.to_string(),
            stream_attempts: AtomicUsize::new(0),
            unary_attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn fetch(&self, _req: &TransportRequest) -> Result<UnaryResponse, TransportError> {
        self.unary_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(UnaryResponse {
            status: 200,
            headers: Default::default(),
            body: self.unary_body.clone(),
        })
    }

    async fn fetch_stream(
        &self,
        _req: &TransportRequest,
        _on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.stream_attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::FetchStreamFailed(
            "connection reset mid-stream".to_string(),
        ))
    }
}

/// Always aborts the streaming attempt.
struct AbortingTransport {
    unary_attempts: AtomicUsize,
}

#[async_trait]
impl Transport for AbortingTransport {
    async fn fetch(&self, _req: &TransportRequest) -> Result<UnaryResponse, TransportError> {
        self.unary_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(UnaryResponse {
            status: 200,
            headers: Default::default(),
            body: String::new(),
        })
    }

    async fn fetch_stream(
        &self,
        _req: &TransportRequest,
        _on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        Err(TransportError::Aborted)
    }
}

#[tokio::test(start_paused = true)]
async fn failed_stream_replays_unary_body_as_chunks() {
    socratic_council::init_logger();
    let transport = FlakyTransport::new("data: hello\n\n");
    let request = TransportRequest::post("https://api.example.test/v1/chat/completions");
    let cancel = CancellationToken::new();

    let fallback_reports = AtomicUsize::new(0);
    let mut received = String::new();
    {
        let on_fallback = |err: &TransportError| {
            assert_eq!(err.code(), "FETCH_STREAM_FAILED");
            fallback_reports.fetch_add(1, Ordering::SeqCst);
        };
        let mut on_chunk = |chunk: &str| received.push_str(chunk);
        stream_with_fallback(
            &transport,
            &request,
            &mut on_chunk,
            &cancel,
            Some(&on_fallback),
        )
        .await
        .unwrap();
    }

    assert_eq!(fallback_reports.load(Ordering::SeqCst), 1);
    assert_eq!(transport.stream_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(transport.unary_attempts.load(Ordering::SeqCst), 1);
    // Downstream SSE parsers see the same bytes a live stream would carry.
    assert!(received.contains("data: hello"));
    assert_eq!(received, "data: hello\n\n");
}

#[tokio::test]
async fn cancellation_never_falls_back() {
    socratic_council::init_logger();
    let transport = AbortingTransport {
        unary_attempts: AtomicUsize::new(0),
    };
    let request = TransportRequest::post("https://api.example.test/v1/messages");
    let cancel = CancellationToken::new();

    let mut on_chunk = |_: &str| {};
    let err = stream_with_fallback(&transport, &request, &mut on_chunk, &cancel, None)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "ABORTED");
    assert_eq!(transport.unary_attempts.load(Ordering::SeqCst), 0);
}

/// Streaming fails and the unary retry answers with an error status: the
/// status must stay visible (it drives the model-fallback policy upstream).
struct DoublyFailingTransport;

#[async_trait]
impl Transport for DoublyFailingTransport {
    async fn fetch(&self, _req: &TransportRequest) -> Result<UnaryResponse, TransportError> {
        Ok(UnaryResponse {
            status: 404,
            headers: Default::default(),
            body: "{\"error\":{\"type\":\"not_found_error\"}}".to_string(),
        })
    }

    async fn fetch_stream(
        &self,
        _req: &TransportRequest,
        _on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        Err(TransportError::FetchStreamFailed("reset".to_string()))
    }
}

#[tokio::test]
async fn fallback_surfaces_http_status() {
    socratic_council::init_logger();
    let request = TransportRequest::post("https://api.example.test/v1/messages");
    let cancel = CancellationToken::new();
    let mut on_chunk = |_: &str| {};

    let err = stream_with_fallback(
        &DoublyFailingTransport,
        &request,
        &mut on_chunk,
        &cancel,
        None,
    )
    .await
    .unwrap_err();

    match err {
        TransportError::HttpError { status, .. } => assert_eq!(status, 404),
        other => panic!("expected HttpError, got {other:?}"),
    }
}
