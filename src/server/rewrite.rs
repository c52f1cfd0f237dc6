// src/server/rewrite.rs
// Clients may prefix any path with a dotted protocol version segment
// (`/v3.0.8/api/v1/state`); the balancer serves the legacy unversioned
// routes, so the segment is stripped before routing.
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::Request;
use regex::Regex;
use std::sync::LazyLock;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// A leading `v<digits and dots>` path segment.
static VERSION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v\d+(\.\d+)*/").unwrap());

/// Strip a client-declared version segment from `uri`, keeping the query
/// string byte-for-byte. Returns `None` when the path is left alone.
///
/// `/v1/` is exempt: it is the OpenAI inference mount, not a protocol
/// version, and is dispatched to the inference proxy as-is. The rewrite is
/// idempotent: a stripped path never matches again.
pub fn strip_version_prefix(uri: &Uri) -> Option<Uri> {
    let path = uri.path();
    if path == "/v1" || path.starts_with("/v1/") {
        return None;
    }

    let matched = VERSION_PREFIX.find(path)?;
    // The match's trailing '/' becomes the new leading slash.
    let stripped = &path[matched.end() - 1..];

    let path_and_query = match uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().ok()?);
    Uri::from_parts(parts).ok()
}

/// Applies [`strip_version_prefix`] to every request before it reaches the
/// routing handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct VersionRewriteLayer;

impl VersionRewriteLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for VersionRewriteLayer {
    type Service = VersionRewrite<S>;

    fn layer(&self, inner: S) -> Self::Service {
        VersionRewrite { inner }
    }
}

#[derive(Clone)]
pub struct VersionRewrite<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for VersionRewrite<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if let Some(rewritten) = strip_version_prefix(req.uri()) {
            tracing::debug!(from = %req.uri(), to = %rewritten, "stripped version prefix");
            *req.uri_mut() = rewritten;
        }
        self.inner.call(req)
    }
}
