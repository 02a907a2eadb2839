//! Failover across an ordered list of bucket stores.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use super::backend::{BucketStore, StoreError, TakeOutcome};
use super::rate::Rate;

/// Admission decision with the metadata needed for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    pub remaining: u32,
    /// When the next token is available, if the answering store knows.
    pub reset_at: Option<SystemTime>,
}

/// A primary store followed by fallbacks.
///
/// Fallbacks are consulted only when the store before them fails. A deny is
/// final: asking a fallback with looser state would let clients bypass the
/// limit.
pub struct StoreChain {
    rate: Rate,
    primary: Arc<dyn BucketStore>,
    fallbacks: Vec<Arc<dyn BucketStore>>,
}

impl StoreChain {
    /// Initialize `primary` and every fallback with `rate` and chain them.
    pub fn new(
        rate: Rate,
        primary: Arc<dyn BucketStore>,
        fallbacks: Vec<Arc<dyn BucketStore>>,
    ) -> Result<Self, StoreError> {
        primary.init_rate(rate)?;
        for store in &fallbacks {
            store.init_rate(rate)?;
        }

        Ok(Self {
            rate,
            primary,
            fallbacks,
        })
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// Take one token for `key` from the first store that answers, along
    /// with that store's reset time.
    ///
    /// Returns the last store's error when every store fails; callers must
    /// then deny.
    pub async fn take(&self, key: &str) -> Result<Decision, StoreError> {
        let (outcome, store) = self.first_answer(key).await?;
        let reset_at = match store.reset_clock() {
            Some(clock) => Some(clock.reset_time(key).await),
            None => None,
        };

        Ok(Decision {
            admitted: outcome.admitted,
            remaining: outcome.remaining,
            reset_at,
        })
    }

    /// Like [`StoreChain::take`] without the reset time lookup.
    pub async fn take_token(&self, key: &str) -> Result<TakeOutcome, StoreError> {
        self.first_answer(key).await.map(|(outcome, _)| outcome)
    }

    async fn first_answer(
        &self,
        key: &str,
    ) -> Result<(TakeOutcome, &Arc<dyn BucketStore>), StoreError> {
        let mut store = &self.primary;
        let mut next = self.fallbacks.iter();
        let mut position = 0;

        loop {
            match store.take(key).await {
                Ok(outcome) => {
                    debug!(
                        key = %key,
                        store = store.name(),
                        admitted = outcome.admitted,
                        remaining = outcome.remaining,
                        "Bucket store answered"
                    );
                    return Ok((outcome, store));
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        store = store.name(),
                        position,
                        error = %e,
                        "Bucket store failed"
                    );
                    match next.next() {
                        Some(fallback) => {
                            store = fallback;
                            position += 1;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::ratelimit::{MemoryStore, TimeWindow};

    /// Store with a fixed answer that counts how often it is asked.
    pub(crate) struct FixedStore {
        answer: Option<bool>,
        pub(crate) calls: AtomicUsize,
    }

    impl FixedStore {
        pub(crate) fn failing() -> Self {
            Self {
                answer: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn admitting() -> Self {
            Self {
                answer: Some(true),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn denying() -> Self {
            Self {
                answer: Some(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BucketStore for FixedStore {
        fn init_rate(&self, _rate: Rate) -> Result<(), StoreError> {
            Ok(())
        }

        async fn take(&self, _key: &str) -> Result<TakeOutcome, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answer {
                Some(true) => Ok(TakeOutcome::admitted(7)),
                Some(false) => Ok(TakeOutcome::denied()),
                None => Err(StoreError::Backend("unreachable".to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn rate() -> Rate {
        Rate::per(10, TimeWindow::Minute).unwrap()
    }

    #[tokio::test]
    async fn test_failover_on_backend_error() {
        let primary = Arc::new(FixedStore::failing());
        let fallback = Arc::new(FixedStore::admitting());
        let chain = StoreChain::new(rate(), primary.clone(), vec![fallback.clone()]).unwrap();

        let decision = chain.take("k").await.unwrap();

        assert!(decision.admitted);
        assert_eq!(decision.remaining, 7);
        assert_eq!(decision.reset_at, None);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deny_is_never_overridden() {
        let primary = Arc::new(FixedStore::denying());
        let fallback = Arc::new(FixedStore::admitting());
        let chain = StoreChain::new(rate(), primary, vec![fallback.clone()]).unwrap();

        let decision = chain.take("k").await.unwrap();

        assert!(!decision.admitted);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallbacks_tried_in_order() {
        let first = Arc::new(FixedStore::failing());
        let second = Arc::new(FixedStore::denying());
        let third = Arc::new(FixedStore::admitting());
        let chain =
            StoreChain::new(rate(), first, vec![second.clone(), third.clone()]).unwrap();

        assert!(!chain.take("k").await.unwrap().admitted);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_stores_failing_is_an_error() {
        let chain = StoreChain::new(
            rate(),
            Arc::new(FixedStore::failing()),
            vec![Arc::new(FixedStore::failing())],
        )
        .unwrap();

        let err = chain.take("k").await.unwrap_err();
        assert!(err.is_backend_fault());
    }

    #[tokio::test]
    async fn test_every_store_is_asked_once_before_giving_up() {
        let stores: Vec<_> = (0..3).map(|_| Arc::new(FixedStore::failing())).collect();
        let chain = StoreChain::new(
            rate(),
            stores[0].clone(),
            vec![stores[1].clone(), stores[2].clone()],
        )
        .unwrap();

        assert!(matches!(
            chain.take_token("k").await,
            Err(StoreError::Backend(_))
        ));
        for store in &stores {
            assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_new_initializes_every_store() {
        let primary = Arc::new(MemoryStore::new());
        let fallback = Arc::new(MemoryStore::new());
        let _chain = StoreChain::new(rate(), primary.clone(), vec![fallback.clone()]).unwrap();

        assert!(primary.is_running());
        assert!(fallback.is_running());

        // A store may only belong to one chain.
        assert!(matches!(
            StoreChain::new(rate(), primary, vec![]),
            Err(StoreError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_reset_time_comes_from_answering_store() {
        let chain = StoreChain::new(rate(), Arc::new(MemoryStore::new()), vec![]).unwrap();

        let decision = chain.take("k").await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 9);
        assert!(decision.reset_at.is_some());
    }

    #[tokio::test]
    async fn test_take_token_skips_reset_lookup() {
        let chain = StoreChain::new(rate(), Arc::new(FixedStore::denying()), vec![]).unwrap();
        assert_eq!(chain.take_token("k").await.unwrap(), TakeOutcome::denied());
    }
}
