//! Token bucket accounting and bucket storage.

mod backend;
mod chain;
mod distributed;
mod memory;
mod rate;

pub use backend::{BucketStore, ResetClock, StoreError, TakeOutcome};
pub use chain::{Decision, StoreChain};
pub use distributed::{Append, DistributedStore, ListBackend, RedisBackend, DEFAULT_KEY_PREFIX};
pub use memory::MemoryStore;
pub use rate::{Rate, TimeWindow, MAX_REQUESTS};
