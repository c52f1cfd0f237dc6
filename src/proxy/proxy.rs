// ────────────────────────────────
// src/proxy/proxy.rs
// Per-request proxy logic: route dispatch, backend selection, streaming
// forwarding with exactly-once accounting release.
// ────────────────────────────────

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Settings;
use crate::metrics::MetricsCollector;
use crate::proxy::pool::{BackendLease, BackendPool};

/// Methods accepted on the proxied surfaces.
pub const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
    Method::HEAD,
];

/// Response headers never forwarded downstream; hyper does its own framing.
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

pub struct Proxy {
    settings: Arc<Settings>,
    pool: Arc<BackendPool>,
    client: reqwest::Client,
    metrics: Arc<MetricsCollector>,
}

impl Proxy {
    pub fn new(
        settings: Arc<Settings>,
        pool: Arc<BackendPool>,
        client: reqwest::Client,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            settings,
            pool,
            client,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Dispatch one incoming request. Request-scoped failures come back as
    /// `ProxyError` and are rendered by the handler; nothing here can take
    /// the process down.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let request_id = Uuid::new_v4();
        let span = tracing::debug_span!(
            "request",
            %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        self.dispatch(req).instrument(span).await
    }

    async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let path = req.uri().path().to_string();

        if path == "/api/v1/state" {
            return Ok(if req.method() == Method::GET {
                json_response(StatusCode::OK, &self.pool.snapshot())
            } else {
                method_not_allowed()
            });
        }

        if path == "/health" {
            return Ok(if req.method() == Method::GET {
                self.health_response()
            } else {
                method_not_allowed()
            });
        }

        if !SUPPORTED_METHODS.contains(req.method()) {
            return Ok(method_not_allowed());
        }

        if path.starts_with("/v1/") {
            let lease = self.pool.pick().await?;
            tracing::debug!(backend = %lease.backend().url(), "selected backend");
            return self.forward(req, lease, "").await;
        }

        // Legacy passthrough: everything else goes to the first configured
        // backend, bypassing selection.
        let lease = self.pool.lease_first()?;
        self.forward(req, lease, "").await
    }

    fn health_response(&self) -> Response<Body> {
        if self.pool.any_available() {
            json_response(StatusCode::OK, &json!({ "status": "healthy" }))
        } else {
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "detail": "No healthy inference backends" }),
            )
        }
    }

    /// Stream `req` to the leased backend and stream its response back.
    ///
    /// The lease rides inside the response body, so the backend's slot is
    /// held for the real duration of the response, long chat completions
    /// included. It is released exactly once on drain, disconnect, or
    /// stream failure. An open failure drops the lease right here.
    async fn forward(
        &self,
        req: Request<Body>,
        lease: BackendLease,
        mount_path: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let backend_url = lease.backend().url().to_string();
        let method = req.method().clone();

        let mut target_path = req.uri().path().to_string();
        if !mount_path.is_empty() && target_path.starts_with(mount_path) {
            target_path = target_path[mount_path.len()..].to_string();
            if !target_path.starts_with('/') {
                target_path.insert(0, '/');
            }
        }

        let url = match req.uri().query() {
            Some(query) => format!("{backend_url}{target_path}?{query}"),
            None => format!("{backend_url}{target_path}"),
        };

        let mut headers = req.headers().clone();
        headers.remove(HOST);

        // The downstream body is handed to reqwest as-is: both directions
        // stay chunked pipes, nothing is buffered in full.
        let upstream = tokio::time::timeout(
            self.settings.request_timeout,
            self.client
                .request(method.clone(), url.as_str())
                .headers(headers)
                .body(reqwest::Body::wrap_stream(req.into_body()))
                .send(),
        )
        .await;

        let upstream = match upstream {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                self.metrics.record_upstream_failure(&backend_url);
                tracing::warn!(%url, error = %err, "upstream request failed");
                return Err(ProxyError::Upstream(err.to_string()));
            }
            Err(_) => {
                self.metrics.record_upstream_failure(&backend_url);
                tracing::warn!(%url, "upstream request timed out");
                return Err(ProxyError::Upstream("request timed out".to_string()));
            }
        };

        let status = upstream.status();
        self.metrics
            .record_request(method.as_str(), status.as_u16(), &backend_url);

        let mut builder = Response::builder().status(status);
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                    response_headers.append(name.clone(), value.clone());
                }
            }
        }

        // Each read of the upstream stream is bounded by the request
        // timeout; there is no overall deadline.
        let read_timeout = self.settings.request_timeout;
        let chunks = tokio_stream::StreamExt::timeout(upstream.bytes_stream(), read_timeout).map(
            |item| match item {
                Ok(Ok(chunk)) => Ok(chunk),
                Ok(Err(err)) => Err(io::Error::new(io::ErrorKind::Other, err)),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream read timed out",
                )),
            },
        );

        let body = Body::wrap_stream(LeasedStream::new(chunks, lease));
        Ok(builder.body(body).unwrap())
    }
}

/// Request-scoped proxy failures. Each variant renders as a fixed JSON
/// `{"detail": …}` body via the `From` impl below.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy inference backends available")]
    NoHealthyBackends,

    #[error("No MLNode backends configured")]
    NoBackendsConfigured,

    #[error("Upstream request failed: {0}")]
    Upstream(String),
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, detail) = match err {
            ProxyError::NoHealthyBackends => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No healthy inference backends available",
            ),
            ProxyError::NoBackendsConfigured => {
                (StatusCode::SERVICE_UNAVAILABLE, "No MLNode backends configured")
            }
            ProxyError::Upstream(_) => (StatusCode::BAD_GATEWAY, "Upstream request failed"),
        };

        json_response(status, &json!({ "detail": detail }))
    }
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

fn method_not_allowed() -> Response<Body> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &json!({ "detail": "Method Not Allowed" }),
    )
}

/// Upstream byte stream that owns the backend lease. Dropping the stream
/// (fully drained, client disconnected, or errored) releases the backend.
struct LeasedStream {
    inner: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>,
    _lease: BackendLease,
}

impl LeasedStream {
    fn new<S>(inner: S, lease: BackendLease) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            _lease: lease,
        }
    }
}

impl Stream for LeasedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}
