//! Distributed bucket store backed by Redis.
//!
//! Each key is a Redis list whose length is the number of tokens consumed
//! and whose TTL is the remaining window. Every process pointed at the same
//! Redis shares one bucket per key, and each key's window starts at its own
//! first take.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::backend::{BucketStore, ResetClock, StoreError, TakeOutcome};
use super::rate::Rate;

/// Default prefix for every key written to Redis.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// Outcome of an atomic append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Appended; the list now has this many entries.
    Appended(u64),
    /// The key does not exist (conditional append only).
    Missing,
    /// The list already holds `capacity` entries.
    Full,
}

/// The list operations the distributed store needs from its backend.
///
/// Each method must be atomic with respect to other clients of the same
/// backend. The capacity check is part of the atomic step, so two clients
/// that both saw one free slot cannot both append.
#[async_trait]
pub trait ListBackend: Send + Sync {
    /// Length of the list at `key`, zero when absent.
    async fn len(&self, key: &str) -> Result<u64, StoreError>;

    /// Append one entry only if `key` exists and holds fewer than
    /// `capacity` entries.
    async fn append_existing(&self, key: &str, capacity: u64) -> Result<Append, StoreError>;

    /// Append one entry, creating the list if needed, and set its expiry.
    async fn append_with_expiry(
        &self,
        key: &str,
        capacity: u64,
        ttl_secs: u64,
    ) -> Result<Append, StoreError>;

    /// Remaining time to live of `key`, `None` when absent or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

const APPEND_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[1]) then
    return -1
end
return redis.call('RPUSHX', KEYS[1], '')
"#;

const APPEND_WITH_EXPIRY: &str = r#"
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[1]) then
    return -1
end
local len = redis.call('RPUSH', KEYS[1], '')
redis.call('EXPIRE', KEYS[1], ARGV[2])
return len
"#;

fn append_from_reply(reply: i64) -> Append {
    match reply {
        r if r > 0 => Append::Appended(r as u64),
        0 => Append::Missing,
        _ => Append::Full,
    }
}

/// Connection attempts per connect or reconnect.
const CONNECT_RETRIES: usize = 1;

/// Bound on connecting and on each command, so a slow server surfaces as a
/// backend error.
const REDIS_TIMEOUT: Duration = Duration::from_secs(1);

/// [`ListBackend`] over a Redis connection manager.
///
/// Appends run as Lua scripts, which Redis executes atomically. The
/// connection is opened on first use and shared by clones, so a server that
/// is down at startup fails each call until it comes up.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    append_existing: Script,
    append_with_expiry: Script,
}

impl RedisBackend {
    /// Parse `url` without connecting.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: Arc::new(OnceCell::new()),
            append_existing: Script::new(APPEND_EXISTING),
            append_with_expiry: Script::new(APPEND_WITH_EXPIRY),
        })
    }

    /// Open a managed connection to the Redis server at `url` right away.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let backend = Self::open(url)?;
        backend.connection().await?;
        Ok(backend)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(CONNECT_RETRIES)
                    .set_connection_timeout(REDIS_TIMEOUT)
                    .set_response_timeout(REDIS_TIMEOUT);
                let connection =
                    ConnectionManager::new_with_config(self.client.clone(), config).await?;
                info!(addr = ?self.client.get_connection_info().addr, "Connected to Redis");
                Ok::<_, StoreError>(connection)
            })
            .await?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl ListBackend for RedisBackend {
    async fn len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn append_existing(&self, key: &str, capacity: u64) -> Result<Append, StoreError> {
        let mut conn = self.connection().await?;
        let reply: i64 = self
            .append_existing
            .key(key)
            .arg(capacity)
            .invoke_async(&mut conn)
            .await?;
        Ok(append_from_reply(reply))
    }

    async fn append_with_expiry(
        &self,
        key: &str,
        capacity: u64,
        ttl_secs: u64,
    ) -> Result<Append, StoreError> {
        let mut conn = self.connection().await?;
        let reply: i64 = self
            .append_with_expiry
            .key(key)
            .arg(capacity)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(append_from_reply(reply))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection().await?;
        // -2 when the key is missing, -1 when it has no expiry.
        let ttl: i64 = conn.ttl(key).await?;
        Ok(u64::try_from(ttl).ok().map(Duration::from_secs))
    }
}

/// Token bucket store shared across processes through a [`ListBackend`].
pub struct DistributedStore<B: ListBackend = RedisBackend> {
    backend: B,
    prefix: String,
    rate: OnceLock<Rate>,
}

impl<B: ListBackend> DistributedStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_prefix(backend, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(backend: B, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            rate: OnceLock::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl<B: ListBackend> BucketStore for DistributedStore<B> {
    fn init_rate(&self, rate: Rate) -> Result<(), StoreError> {
        self.rate
            .set(rate)
            .map_err(|_| StoreError::AlreadyInitialized)?;
        info!(rate = %rate, prefix = %self.prefix, "Distributed bucket store initialized");
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<TakeOutcome, StoreError> {
        let rate = self.rate.get().ok_or(StoreError::Uninitialized)?;
        let capacity = u64::from(rate.requests());
        let storage_key = self.storage_key(key);

        let len = self.backend.len(&storage_key).await?;
        if len >= capacity {
            trace!(key = %storage_key, len, "Bucket full");
            return Ok(TakeOutcome::denied());
        }

        if len > 0 {
            match self.backend.append_existing(&storage_key, capacity).await? {
                Append::Appended(new_len) => return Ok(admitted(capacity, new_len)),
                Append::Full => return Ok(TakeOutcome::denied()),
                Append::Missing => {
                    debug!(key = %storage_key, "Bucket expired during take, recreating");
                }
            }
        }

        match self
            .backend
            .append_with_expiry(&storage_key, capacity, rate.window_secs())
            .await?
        {
            Append::Appended(new_len) => Ok(admitted(capacity, new_len)),
            Append::Full | Append::Missing => Ok(TakeOutcome::denied()),
        }
    }

    fn reset_clock(&self) -> Option<&dyn ResetClock> {
        Some(self)
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

#[async_trait]
impl<B: ListBackend> ResetClock for DistributedStore<B> {
    async fn reset_time(&self, key: &str) -> SystemTime {
        let now = SystemTime::now();
        match self.backend.ttl(&self.storage_key(key)).await {
            Ok(Some(ttl)) => now + ttl,
            Ok(None) => now,
            Err(e) => {
                debug!(key = %key, error = %e, "Failed to read bucket TTL");
                now
            }
        }
    }
}

fn admitted(capacity: u64, len: u64) -> TakeOutcome {
    TakeOutcome::admitted(u32::try_from(capacity.saturating_sub(len)).unwrap_or(u32::MAX))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use crate::ratelimit::TimeWindow;

    /// In-process stand-in for Redis lists with key expiry.
    #[derive(Default)]
    pub(crate) struct LocalLists {
        lists: Mutex<HashMap<String, (u64, Instant)>>,
        pub(crate) fail: AtomicBool,
        /// Expire every key right after the next `len` call.
        pub(crate) expire_after_len: AtomicBool,
    }

    impl LocalLists {
        fn check(&self) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("connection refused".to_string()));
            }
            Ok(())
        }

        fn live_len(lists: &mut HashMap<String, (u64, Instant)>, key: &str) -> Option<u64> {
            match lists.get(key) {
                Some((_, expires)) if *expires <= Instant::now() => {
                    lists.remove(key);
                    None
                }
                Some((len, _)) => Some(*len),
                None => None,
            }
        }
    }

    #[async_trait]
    impl ListBackend for LocalLists {
        async fn len(&self, key: &str) -> Result<u64, StoreError> {
            self.check()?;
            let mut lists = self.lists.lock();
            let len = Self::live_len(&mut lists, key).unwrap_or(0);
            if self.expire_after_len.swap(false, Ordering::SeqCst) {
                lists.clear();
            }
            Ok(len)
        }

        async fn append_existing(&self, key: &str, capacity: u64) -> Result<Append, StoreError> {
            self.check()?;
            let mut lists = self.lists.lock();
            match Self::live_len(&mut lists, key) {
                None => Ok(Append::Missing),
                Some(len) if len >= capacity => Ok(Append::Full),
                Some(_) => {
                    let entry = lists.get_mut(key).expect("live key");
                    entry.0 += 1;
                    Ok(Append::Appended(entry.0))
                }
            }
        }

        async fn append_with_expiry(
            &self,
            key: &str,
            capacity: u64,
            ttl_secs: u64,
        ) -> Result<Append, StoreError> {
            self.check()?;
            let mut lists = self.lists.lock();
            let len = Self::live_len(&mut lists, key).unwrap_or(0);
            if len >= capacity {
                return Ok(Append::Full);
            }
            let expires = Instant::now() + Duration::from_secs(ttl_secs);
            lists.insert(key.to_string(), (len + 1, expires));
            Ok(Append::Appended(len + 1))
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
            self.check()?;
            let mut lists = self.lists.lock();
            Self::live_len(&mut lists, key);
            Ok(lists
                .get(key)
                .map(|(_, expires)| expires.saturating_duration_since(Instant::now())))
        }
    }

    fn store(requests: u32, window: TimeWindow) -> DistributedStore<LocalLists> {
        let store = DistributedStore::new(LocalLists::default());
        store.init_rate(Rate::per(requests, window).unwrap()).unwrap();
        store
    }

    #[test]
    fn test_append_reply_mapping() {
        assert_eq!(append_from_reply(3), Append::Appended(3));
        assert_eq!(append_from_reply(0), Append::Missing);
        assert_eq!(append_from_reply(-1), Append::Full);
    }

    #[tokio::test]
    async fn test_take_before_init_fails() {
        let store = DistributedStore::new(LocalLists::default());
        assert!(matches!(
            store.take("k").await.unwrap_err(),
            StoreError::Uninitialized
        ));
    }

    #[tokio::test]
    async fn test_take_until_full() {
        let store = store(3, TimeWindow::Minute);

        assert_eq!(store.take("k").await.unwrap(), TakeOutcome::admitted(2));
        assert_eq!(store.take("k").await.unwrap(), TakeOutcome::admitted(1));
        assert_eq!(store.take("k").await.unwrap(), TakeOutcome::admitted(0));
        assert_eq!(store.take("k").await.unwrap(), TakeOutcome::denied());
        assert_eq!(store.backend().len("ratelimit:k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let store = DistributedStore::with_prefix(LocalLists::default(), "app:");
        store.init_rate(Rate::per(5, TimeWindow::Second).unwrap()).unwrap();

        store.take("user").await.unwrap();
        assert_eq!(store.backend().len("app:user").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_refills_bucket() {
        let store = store(1, TimeWindow::Second);

        assert!(store.take("k").await.unwrap().admitted);
        assert!(!store.take("k").await.unwrap().admitted);

        tokio::time::advance(Duration::from_millis(1001)).await;

        assert!(store.take("k").await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_key_expiring_mid_take_is_recreated() {
        let store = store(5, TimeWindow::Minute);
        store.take("k").await.unwrap();

        store.backend().expire_after_len.store(true, Ordering::SeqCst);

        assert_eq!(store.take("k").await.unwrap(), TakeOutcome::admitted(4));
        assert_eq!(store.backend().len("ratelimit:k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_an_error() {
        let store = store(5, TimeWindow::Minute);
        store.backend().fail.store(true, Ordering::SeqCst);

        let err = store.take("k").await.unwrap_err();
        assert!(err.is_backend_fault());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takes_for_last_slot() {
        let store = Arc::new(store(3, TimeWindow::Minute));
        store.take("k").await.unwrap();
        store.take("k").await.unwrap();

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.take("k").await.unwrap().admitted }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.take("k").await.unwrap().admitted }
        });

        let admitted = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(admitted.iter().filter(|a| **a).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takes_never_exceed_rate() {
        let store = Arc::new(store(10, TimeWindow::Minute));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("shared").await.unwrap().admitted })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_time_uses_key_ttl() {
        let store = store(2, TimeWindow::Minute);
        store.take("k").await.unwrap();

        let now = SystemTime::now();
        let reset = store.reset_time("k").await;
        let ahead = reset.duration_since(now).unwrap();
        assert!(ahead > Duration::from_secs(59));
        assert!(ahead <= Duration::from_secs(61));
    }

    #[tokio::test]
    async fn test_reset_time_for_unknown_key_is_now() {
        let store = store(2, TimeWindow::Minute);
        let before = SystemTime::now();
        let reset = store.reset_time("missing").await;
        assert!(reset.duration_since(before).unwrap() < Duration::from_secs(1));
    }
}
