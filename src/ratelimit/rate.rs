//! Rate configuration shared by every bucket store.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use super::backend::StoreError;

/// Named time windows used for readable rate descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Match a duration against the named windows.
    pub fn from_duration(duration: Duration) -> Option<Self> {
        [
            TimeWindow::Second,
            TimeWindow::Minute,
            TimeWindow::Hour,
            TimeWindow::Day,
        ]
        .into_iter()
        .find(|w| w.duration() == duration)
    }

    /// Short unit label, as used in `X-RateLimit-Rate`.
    pub fn label(&self) -> &'static str {
        match self {
            TimeWindow::Second => "sec",
            TimeWindow::Minute => "min",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }
}

/// Largest bucket capacity. `u32::MAX` is reserved by the in-memory store.
pub const MAX_REQUESTS: u32 = u32::MAX - 1;

/// At most `requests` admissions per `window`, refilled one token every
/// `window / requests`.
///
/// A `Rate` can only be built through [`Rate::new`] (or the named
/// constructors), so every value in circulation is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    requests: NonZeroU32,
    window: Duration,
}

impl Rate {
    /// Create a rate of `requests` per `window`.
    ///
    /// Fails when `requests` is zero or above [`MAX_REQUESTS`], or when the
    /// window is too short to give a non-zero refill interval.
    pub fn new(requests: u32, window: Duration) -> Result<Self, StoreError> {
        let requests = NonZeroU32::new(requests)
            .ok_or_else(|| StoreError::InvalidRate("rate must be positive".to_string()))?;

        if requests.get() > MAX_REQUESTS {
            return Err(StoreError::InvalidRate(format!(
                "rate must be at most {}",
                MAX_REQUESTS
            )));
        }

        if window.is_zero() {
            return Err(StoreError::InvalidRate("window must be positive".to_string()));
        }

        if (window / requests.get()).is_zero() {
            return Err(StoreError::InvalidRate(format!(
                "window of {:?} is too short for {} requests",
                window, requests
            )));
        }

        Ok(Self { requests, window })
    }

    /// Create a rate over one of the named windows.
    pub fn per(requests: u32, window: TimeWindow) -> Result<Self, StoreError> {
        Self::new(requests, window.duration())
    }

    /// Bucket capacity.
    pub fn requests(&self) -> u32 {
        self.requests.get()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Time to refill a single token.
    pub fn refill_interval(&self) -> Duration {
        self.window / self.requests.get()
    }

    /// Window length in whole seconds, never less than one.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(window) = TimeWindow::from_duration(self.window) {
            return write!(f, "{} req/{}", self.requests, window.label());
        }

        if self.window.subsec_nanos() == 0 {
            write!(f, "{} req/{}s", self.requests, self.window.as_secs())
        } else {
            write!(f, "{} req/{}ms", self.requests, self.window.as_millis())
        }
    }
}
