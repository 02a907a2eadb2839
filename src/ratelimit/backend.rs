//! Bucket store trait shared by the in-memory and distributed backends.

use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

use super::rate::Rate;

/// Errors reported by bucket stores.
///
/// A full bucket is not an error; see [`TakeOutcome::admitted`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The rate configuration is not usable.
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    /// `take` was called before `init_rate`.
    #[error("Bucket store used before its rate was initialized")]
    Uninitialized,

    /// `init_rate` was called twice.
    #[error("Bucket store rate is already initialized")]
    AlreadyInitialized,

    /// Background work needs a Tokio runtime.
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    /// Redis failure.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error came from the storage backend at request time.
    ///
    /// Only backend faults are worth retrying against a fallback store;
    /// the rest are setup mistakes.
    pub fn is_backend_fault(&self) -> bool {
        matches!(self, StoreError::Redis(_) | StoreError::Backend(_))
    }
}

/// Result of a single `take`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeOutcome {
    /// Whether a token was consumed.
    pub admitted: bool,
    /// Tokens left after this call. Zero on deny.
    pub remaining: u32,
}

impl TakeOutcome {
    pub fn admitted(remaining: u32) -> Self {
        Self {
            admitted: true,
            remaining,
        }
    }

    pub fn denied() -> Self {
        Self {
            admitted: false,
            remaining: 0,
        }
    }
}

/// Token bucket storage.
///
/// Implementations must never let more than `rate.requests()` takes for a
/// key succeed before the bucket refills, no matter how many callers race.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Configure capacity and refill cadence. Call exactly once, before any
    /// `take`.
    fn init_rate(&self, rate: Rate) -> Result<(), StoreError>;

    /// Try to consume one token for `key`. Never waits for capacity.
    async fn take(&self, key: &str) -> Result<TakeOutcome, StoreError>;

    /// Reset-time reporting, when the store supports it.
    fn reset_clock(&self) -> Option<&dyn ResetClock> {
        None
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Reports when the next token for a key becomes available.
#[async_trait]
pub trait ResetClock: Send + Sync {
    async fn reset_time(&self, key: &str) -> SystemTime;
}
