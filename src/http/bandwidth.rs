//! Response bandwidth throttling middleware.
//!
//! Each response body is re-streamed through a [`Throttle`] keyed by
//! `download:<key>`, so a client's downloads share one byte budget.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, BodyDataStream, Bytes};
use axum::http::{Request, Response};
use axum::BoxError;
use futures::future::BoxFuture;
use futures::StreamExt;
use tower::{Layer, Service};
use tracing::trace;

use super::key::KeyFn;
use crate::error::{Result, TokenwardenError};
use crate::ratelimit::{BucketStore, Rate, StoreChain};
use crate::throttle::{Throttle, DEFAULT_QUANTUM, DEFAULT_RETRY_INTERVAL};

const DOWNLOAD_KEY_PREFIX: &str = "download:";

/// Builder for [`BandwidthLayer`].
pub struct BandwidthLayerBuilder {
    key_fn: KeyFn,
    rate: Option<Rate>,
    quantum: usize,
    retry_interval: Duration,
}

impl BandwidthLayerBuilder {
    /// Rate of quanta, not bytes.
    pub fn rate(mut self, rate: Rate) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Bytes granted per token.
    pub fn quantum(mut self, bytes: usize) -> Self {
        self.quantum = bytes;
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn limit_by(
        self,
        primary: Arc<dyn BucketStore>,
        fallbacks: Vec<Arc<dyn BucketStore>>,
    ) -> Result<BandwidthLayer> {
        let rate = self
            .rate
            .ok_or_else(|| TokenwardenError::Config("bandwidth rate is not set".to_string()))?;
        if self.quantum == 0 {
            return Err(TokenwardenError::Config(
                "bandwidth quantum must be positive".to_string(),
            ));
        }

        let chain = StoreChain::new(rate, primary, fallbacks)?;
        Ok(BandwidthLayer {
            shaper: Arc::new(Shaper {
                key_fn: self.key_fn,
                chain: Arc::new(chain),
                quantum: self.quantum,
                retry_interval: self.retry_interval,
            }),
        })
    }
}

struct Shaper {
    key_fn: KeyFn,
    chain: Arc<StoreChain>,
    quantum: usize,
    retry_interval: Duration,
}

impl Shaper {
    fn throttle(&self, key: &str) -> Throttle {
        Throttle::new(self.chain.clone(), format!("{}{}", DOWNLOAD_KEY_PREFIX, key))
            .with_quantum(self.quantum)
            .with_retry_interval(self.retry_interval)
    }
}

/// Layer that caps response throughput per key.
#[derive(Clone)]
pub struct BandwidthLayer {
    shaper: Arc<Shaper>,
}

impl BandwidthLayer {
    pub fn builder<F>(key_fn: F) -> BandwidthLayerBuilder
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        BandwidthLayerBuilder {
            key_fn: Arc::new(key_fn),
            rate: None,
            quantum: DEFAULT_QUANTUM,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl<S> Layer<S> for BandwidthLayer {
    type Service = BandwidthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BandwidthService {
            inner,
            shaper: self.shaper.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BandwidthService<S> {
    inner: S,
    shaper: Arc<Shaper>,
}

impl<S> Service<Request<Body>> for BandwidthService<S>
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
        let shaper = self.shaper.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = (shaper.key_fn)(&req);
            let response = inner.call(req).await?;
            if key.is_empty() {
                return Ok(response);
            }

            trace!(key = %key, "Throttling response body");
            let throttle = shaper.throttle(&key);
            Ok(response.map(|body| throttled_body(body, throttle)))
        })
    }
}

struct BodyState {
    stream: BodyDataStream,
    pending: Bytes,
    throttle: Throttle,
}

/// Re-stream `body` in frames no larger than the throttle's credit.
pub fn throttled_body(body: Body, throttle: Throttle) -> Body {
    let state = BodyState {
        stream: body.into_data_stream(),
        pending: Bytes::new(),
        throttle,
    };
    Body::from_stream(futures::stream::try_unfold(state, next_frame))
}

async fn next_frame(
    mut state: BodyState,
) -> std::result::Result<Option<(Bytes, BodyState)>, BoxError> {
    while state.pending.is_empty() {
        match state.stream.next().await {
            Some(chunk) => state.pending = chunk?,
            None => return Ok(None),
        }
    }

    let allowed = state.throttle.acquire(state.pending.len()).await?;
    let frame = state.pending.split_to(allowed);
    state.throttle.consume(frame.len());

    Ok(Some((frame, state)))
}
