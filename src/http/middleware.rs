//! Per-request rate limiting middleware.
//!
//! # Response Headers
//!
//! On admit:
//! - `X-RateLimit-Key`, `X-RateLimit-Rate`, `X-RateLimit-Limit`,
//!   `X-RateLimit-Remaining`
//! - `X-RateLimit-Reset` (unix seconds) and `Retry-After` (HTTP date) when
//!   the answering store reports reset times
//!
//! On deny (429): `Retry-After` when known.
//!
//! When every store in the chain fails the request is denied with 503.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::key::KeyFn;
use crate::error::{Result, TokenwardenError};
use crate::ratelimit::{BucketStore, Decision, Rate, StoreChain};

/// Prefix for request buckets, keeping them apart from bandwidth buckets.
const REQUEST_KEY_PREFIX: &str = "request:";

pub(crate) const X_RATELIMIT_KEY: &str = "x-ratelimit-key";
pub(crate) const X_RATELIMIT_RATE: &str = "x-ratelimit-rate";
pub(crate) const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub(crate) const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Builder for [`RateLimitLayer`].
pub struct RateLimitLayerBuilder {
    key_fn: KeyFn,
    rate: Option<Rate>,
}

impl RateLimitLayerBuilder {
    pub fn rate(mut self, rate: Rate) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Initialize `primary` and `fallbacks` with the rate and build the
    /// layer.
    pub fn limit_by(
        self,
        primary: Arc<dyn BucketStore>,
        fallbacks: Vec<Arc<dyn BucketStore>>,
    ) -> Result<RateLimitLayer> {
        let rate = self
            .rate
            .ok_or_else(|| TokenwardenError::Config("request rate is not set".to_string()))?;
        let chain = StoreChain::new(rate, primary, fallbacks)?;
        Ok(RateLimitLayer::with_chain(self.key_fn, chain))
    }
}

struct Limiter {
    key_fn: KeyFn,
    chain: StoreChain,
    rate_header: Option<HeaderValue>,
    limit_header: HeaderValue,
}

/// Rate limiting layer for a Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::builder(ip_key)
///     .rate(Rate::per(60, TimeWindow::Minute)?)
///     .limit_by(Arc::new(MemoryStore::new()), vec![])?;
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
}

impl RateLimitLayer {
    pub fn builder<F>(key_fn: F) -> RateLimitLayerBuilder
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        RateLimitLayerBuilder {
            key_fn: Arc::new(key_fn),
            rate: None,
        }
    }

    /// Build the layer over an already initialized chain.
    pub fn with_chain(key_fn: KeyFn, chain: StoreChain) -> Self {
        let rate = chain.rate();
        Self {
            limiter: Arc::new(Limiter {
                key_fn,
                rate_header: HeaderValue::from_str(&rate.to_string()).ok(),
                limit_header: HeaderValue::from(rate.requests()),
                chain,
            }),
        }
    }

    pub fn rate(&self) -> Rate {
        self.limiter.chain.rate()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = (limiter.key_fn)(&req);
            if key.is_empty() {
                trace!(path = %req.uri().path(), "No rate limit key, skipping");
                return inner.call(req).await;
            }

            let bucket = format!("{}{}", REQUEST_KEY_PREFIX, key);
            let decision = match limiter.chain.take(&bucket).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(key = %key, error = %e, "All bucket stores failed, denying request");
                    return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE, None));
                }
            };

            if !decision.admitted {
                debug!(key = %key, path = %req.uri().path(), "Rate limit exceeded");
                return Ok(status_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    decision.reset_at,
                ));
            }

            let mut response = inner.call(req).await?;
            limiter.annotate(response.headers_mut(), &key, &decision);
            Ok(response)
        })
    }
}

impl Limiter {
    fn annotate(&self, headers: &mut HeaderMap, key: &str, decision: &Decision) {
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert(X_RATELIMIT_KEY, value);
        }
        if let Some(rate) = &self.rate_header {
            headers.insert(X_RATELIMIT_RATE, rate.clone());
        }
        headers.insert(X_RATELIMIT_LIMIT, self.limit_header.clone());
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));

        if let Some(reset_at) = decision.reset_at {
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(unix_secs(reset_at)));
            if let Ok(value) = HeaderValue::from_str(&http_date(reset_at)) {
                headers.insert(RETRY_AFTER, value);
            }
        }
    }
}

/// Plain-text response carrying the canonical reason phrase.
fn status_response(status: StatusCode, retry_at: Option<SystemTime>) -> Response<Body> {
    let mut response = Response::new(Body::from(
        status.canonical_reason().unwrap_or_default(),
    ));
    *response.status_mut() = status;

    if let Some(value) = retry_at.and_then(|t| HeaderValue::from_str(&http_date(t)).ok()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }

    response
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// IMF-fixdate, as used by `Retry-After`.
pub(crate) fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
