//! In-process bucket store.
//!
//! Buckets live in a single map guarded by one mutex. Token consumption is a
//! lock-free bounded increment on the bucket itself, so callers only contend
//! on the map while looking a bucket up or creating it.
//!
//! A background task returns one token to every bucket each
//! `window / rate`, and drops buckets once they are empty. All keys share
//! that one clock: a key does not get its own window starting at its first
//! request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::backend::{BucketStore, ResetClock, StoreError, TakeOutcome};
use super::rate::{Rate, MAX_REQUESTS};

/// Marks a bucket the decay sweep has removed from the map. Never a real
/// count since capacity is capped at [`MAX_REQUESTS`].
const RETIRED: u32 = u32::MAX;

#[derive(Debug, Default)]
struct Bucket {
    consumed: AtomicU32,
}

enum Slot {
    Taken(u32),
    Full,
    Retired,
}

impl Bucket {
    fn try_take(&self, capacity: u32) -> Slot {
        let result = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                if consumed == RETIRED || consumed >= capacity {
                    None
                } else {
                    Some(consumed + 1)
                }
            });

        match result {
            Ok(previous) => Slot::Taken(previous + 1),
            Err(RETIRED) => Slot::Retired,
            Err(_) => Slot::Full,
        }
    }

    /// Return one token. Returns `true` once the bucket is empty and retired.
    fn decay(&self) -> bool {
        let result = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                match consumed {
                    RETIRED => None,
                    0 | 1 => Some(RETIRED),
                    n => Some(n - 1),
                }
            });

        !matches!(result, Ok(n) if n > 1)
    }

    fn consumed(&self) -> u32 {
        match self.consumed.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }
}

struct Buckets {
    map: HashMap<String, Arc<Bucket>>,
    /// When the next token is returned, for every key.
    next_reset: SystemTime,
}

struct DecayTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Token bucket store held in process memory.
///
/// The decay task starts in [`BucketStore::init_rate`] and runs until
/// [`MemoryStore::stop`] is called or the store is dropped.
pub struct MemoryStore {
    state: Arc<Mutex<Buckets>>,
    rate: OnceLock<Rate>,
    decay: Mutex<Option<DecayTask>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(Buckets {
                map: HashMap::new(),
                next_reset: SystemTime::now(),
            })),
            rate: OnceLock::new(),
            decay: Mutex::new(None),
        }
    }

    /// Stop the decay task. Buckets keep whatever they hold.
    pub fn stop(&self) {
        if let Some(task) = self.decay.lock().take() {
            task.cancel.cancel();
            info!("In-memory bucket store stopped");
        }
    }

    /// Whether the decay task is still running.
    pub fn is_running(&self) -> bool {
        self.decay
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Tokens currently consumed for `key`, if it has a bucket.
    pub fn consumed(&self, key: &str) -> Option<u32> {
        self.state.lock().map.get(key).map(|b| b.consumed())
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        let mut buckets = self.state.lock();
        if let Some(bucket) = buckets.map.get(key) {
            return bucket.clone();
        }

        trace!(key = %key, "Creating bucket");
        let bucket = Arc::new(Bucket::default());
        buckets.map.insert(key.to_owned(), bucket.clone());
        bucket
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(task) = self.decay.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    fn init_rate(&self, rate: Rate) -> Result<(), StoreError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::NoRuntime(e.to_string()))?;
        self.rate
            .set(rate)
            .map_err(|_| StoreError::AlreadyInitialized)?;

        let interval = rate.refill_interval();
        self.state.lock().next_reset = SystemTime::now() + interval;

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_decay(self.state.clone(), interval, cancel.clone()));
        *self.decay.lock() = Some(DecayTask { cancel, handle });

        info!(rate = %rate, interval = ?interval, "In-memory bucket store started");
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<TakeOutcome, StoreError> {
        let capacity = self.rate.get().ok_or(StoreError::Uninitialized)?.requests();

        loop {
            match self.bucket(key).try_take(capacity) {
                Slot::Taken(consumed) => return Ok(TakeOutcome::admitted(capacity - consumed)),
                Slot::Full => return Ok(TakeOutcome::denied()),
                // Swept between lookup and increment; the map no longer has it.
                Slot::Retired => continue,
            }
        }
    }

    fn reset_clock(&self) -> Option<&dyn ResetClock> {
        Some(self)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ResetClock for MemoryStore {
    async fn reset_time(&self, _key: &str) -> SystemTime {
        self.state.lock().next_reset
    }
}

async fn run_decay(state: Arc<Mutex<Buckets>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => sweep(&state, interval),
        }
    }

    debug!("Decay task shutting down");
}

fn sweep(state: &Mutex<Buckets>, interval: Duration) {
    let mut buckets = state.lock();
    buckets.next_reset = SystemTime::now() + interval;

    let before = buckets.map.len();
    buckets.map.retain(|_, bucket| !bucket.decay());

    trace!(
        buckets = buckets.map.len(),
        reclaimed = before - buckets.map.len(),
        "Decay sweep finished"
    );
}
