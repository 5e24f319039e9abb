//! Shared counter store.
//!
//! Every worker talks to the same logical store. Correctness of the
//! limiter depends only on the store executing each bucket transaction
//! atomically per key; there is no locking between workers.

mod memory;
mod redis_store;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::ratelimit::bucket::{BucketDecision, BucketParams, BucketState};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Trait for counter store implementations.
///
/// This trait abstracts over the in-process store used by tests and
/// single-node deployments and the networked Redis store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Refill and consume `cost` tokens from the bucket at `key` in one
    /// atomic transaction, using the store's clock.
    async fn consume(&self, key: &str, params: &BucketParams, cost: f64) -> Result<BucketDecision>;

    /// The store's clock, epoch seconds.
    async fn now(&self) -> Result<f64>;

    /// Live bucket records whose key starts with `prefix`.
    ///
    /// Best effort: records created or expiring during the scan may or may
    /// not be included.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, BucketState)>>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Source of time for stores that keep their own clock.
pub trait Clock: Send + Sync {
    /// Current time, epoch seconds.
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock that only moves when told to. Used in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
