//! Byte-rate shaping on top of a bucket store.
//!
//! Each token taken from the store grants one quantum of bytes (1024 by
//! default). The writer keeps the unspent part of its grants as credit and
//! only goes back to the store once credit drops below a quantum.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::ratelimit::{StoreChain, StoreError};

/// Bytes granted per token.
pub const DEFAULT_QUANTUM: usize = 1024;

/// Wait between takes while the bucket is full.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Byte credit for one key.
pub struct Throttle {
    chain: Arc<StoreChain>,
    key: String,
    quantum: usize,
    retry_interval: Duration,
    credit: usize,
}

impl Throttle {
    pub fn new(chain: Arc<StoreChain>, key: impl Into<String>) -> Self {
        Self {
            chain,
            key: key.into(),
            quantum: DEFAULT_QUANTUM,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            credit: 0,
        }
    }

    pub fn with_quantum(mut self, quantum: usize) -> Self {
        self.quantum = quantum.max(1);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes that may be written without another take.
    pub fn credit(&self) -> usize {
        self.credit
    }

    /// Wait for credit and return how many of `want` bytes may go out now.
    ///
    /// Tops up by one quantum whenever credit is below a quantum. A full
    /// bucket is retried after the retry interval; a store failure is
    /// returned as is.
    pub async fn acquire(&mut self, want: usize) -> Result<usize, StoreError> {
        if want == 0 {
            return Ok(0);
        }

        loop {
            if self.credit < self.quantum && self.chain.take_token(&self.key).await?.admitted {
                self.credit += self.quantum;
            }

            if self.credit > 0 {
                return Ok(want.min(self.credit));
            }

            trace!(key = %self.key, "Bandwidth bucket full, waiting");
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Spend credit for bytes actually written.
    pub fn consume(&mut self, bytes: usize) {
        self.credit = self.credit.saturating_sub(bytes);
    }
}

/// An [`AsyncWrite`] sink whose throughput is capped by a [`Throttle`].
pub struct ThrottledWriter<W> {
    inner: W,
    throttle: Throttle,
}

impl<W: AsyncWrite + Unpin> ThrottledWriter<W> {
    pub fn new(inner: W, throttle: Throttle) -> Self {
        Self { inner, throttle }
    }

    /// Write all of `buf`, never handing the sink more than the current
    /// credit at once.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut total = 0;

        while total < buf.len() {
            let allowed = self
                .throttle
                .acquire(buf.len() - total)
                .await
                .map_err(io::Error::other)?;

            let written = self.inner.write(&buf[total..total + allowed]).await?;
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.throttle.consume(written);
            total += written;
        }

        Ok(total)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
