//! In-process counter store.
//!
//! Suitable for a single worker and for tests. Each transaction runs under
//! the map's per-shard entry lock, which makes it atomic per key. Expired
//! records are swept every [`PURGE_EVERY`] transactions.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{Clock, CounterStore, SystemClock};
use crate::error::Result;
use crate::ratelimit::bucket::{transact, BucketDecision, BucketParams, BucketState};

/// Transactions between sweeps of expired records.
pub const PURGE_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Record {
    state: BucketState,
    expires_at: f64,
}

impl Record {
    fn is_live(&self, now: f64) -> bool {
        self.expires_at > now
    }
}

/// Counter store backed by a concurrent hash map.
pub struct MemoryStore {
    buckets: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
    transactions: AtomicU64,
}

impl MemoryStore {
    /// Create a store that reads the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            transactions: AtomicU64::new(0),
        }
    }

    /// Number of live bucket records.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.buckets.iter().filter(|r| r.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one bucket record, if live.
    pub fn get(&self, key: &str) -> Option<BucketState> {
        let now = self.clock.now();
        self.buckets
            .get(key)
            .filter(|r| r.value().is_live(now))
            .map(|r| r.value().state)
    }

    /// Number of records held, expired ones included.
    pub fn stored(&self) -> usize {
        self.buckets.len()
    }

    /// Drop expired records.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, record| record.is_live(now));
        let purged = before.saturating_sub(self.buckets.len());
        if purged > 0 {
            debug!(purged, remaining = self.buckets.len(), "Purged expired buckets");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn consume(&self, key: &str, params: &BucketParams, cost: f64) -> Result<BucketDecision> {
        let now = self.clock.now();
        let expires_at = now + params.ttl_secs() as f64;

        let decision = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let prior = record.is_live(now).then_some(&record.state);
                let (state, decision) = transact(prior, params, cost, now);
                *record = Record { state, expires_at };
                decision
            }
            Entry::Vacant(vacant) => {
                let (state, decision) = transact(None, params, cost, now);
                vacant.insert(Record { state, expires_at });
                decision
            }
        };

        trace!(
            key = %key,
            allowed = decision.allowed,
            tokens = decision.tokens_remaining,
            "Memory store transaction"
        );

        // Entry lock is released above; retain takes every shard lock.
        if (self.transactions.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            self.purge_expired();
        }
        Ok(decision)
    }

    async fn now(&self) -> Result<f64> {
        Ok(self.clock.now())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, BucketState)>> {
        self.purge_expired();
        let now = self.clock.now();
        Ok(self
            .buckets
            .iter()
            .filter(|r| r.key().starts_with(prefix) && r.value().is_live(now))
            .map(|r| (r.key().clone(), r.value().state))
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let now = self.clock.now();
        Ok(keys
            .iter()
            .filter_map(|key| self.buckets.remove(key))
            .filter(|(_, record)| record.is_live(now))
            .count())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
