//! Token bucket engine: one store transaction per check, bounded by a
//! timeout and resolved by an explicit failure policy when the store
//! cannot answer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

use super::bucket::{BucketDecision, BucketParams};
use super::key::ScopeKey;
use super::rules::LimitDefinition;
use crate::error::{Result, TollboothError};
use crate::store::{Clock, CounterStore, SystemClock};

/// Default store round-trip budget.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default prefix for bucket keys in the store.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";
/// Retry hint given to callers denied because the store was unreachable.
const FAIL_CLOSED_RETRY_SECS: f64 = 1.0;

/// What to do when the counter store cannot be reached in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and flag the verdict as degraded.
    Open,
    /// Deny the request and flag the verdict as degraded.
    Closed,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Open => f.write_str("open"),
            FailurePolicy::Closed => f.write_str("closed"),
        }
    }
}

/// Verdict for one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens left; `None` when the store could not be consulted
    pub tokens_remaining: Option<f64>,
    /// Epoch seconds
    pub reset_at: f64,
    /// Store clock at decision time (local clock when degraded)
    pub now: f64,
    /// The verdict came from the failure policy, not the store
    pub degraded: bool,
}

/// Runs bucket transactions against the shared counter store.
pub struct TokenBucketEngine {
    store: Arc<dyn CounterStore>,
    policy: FailurePolicy,
    timeout: Duration,
    key_prefix: String,
    local_clock: Arc<dyn Clock>,
}

impl TokenBucketEngine {
    pub fn new(store: Arc<dyn CounterStore>, policy: FailurePolicy) -> Self {
        Self {
            store,
            policy,
            timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            local_clock: Arc::new(SystemClock),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Clock used only to fill in reset times for degraded verdicts.
    pub fn with_local_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.local_clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Refill the bucket for `key` and try to take `cost` tokens.
    ///
    /// Never fails: store errors and timeouts resolve through the
    /// configured [`FailurePolicy`].
    pub async fn check_and_consume(
        &self,
        key: &ScopeKey,
        definition: &LimitDefinition,
        cost: u32,
    ) -> BucketOutcome {
        let cost = cost.max(1) as f64;
        let params = BucketParams::from_definition(definition);
        let store_key = key.to_store_key(&self.key_prefix);
        let started = Instant::now();

        match self.consume(&store_key, &params, cost).await {
            Ok(decision) => {
                trace!(
                    key = %store_key,
                    allowed = decision.allowed,
                    tokens = decision.tokens_remaining,
                    limit = params.limit,
                    "Bucket checked"
                );
                BucketOutcome {
                    allowed: decision.allowed,
                    tokens_remaining: Some(decision.tokens_remaining),
                    reset_at: decision.reset_at,
                    now: decision.now,
                    degraded: false,
                }
            }
            Err(e) => {
                let elapsed = started.elapsed();
                error!(
                    key = %store_key,
                    operation = "consume",
                    backend = self.store.backend(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    policy = %self.policy,
                    error = %e,
                    "Counter store failure, applying failure policy"
                );
                self.degraded(&params)
            }
        }
    }

    async fn consume(
        &self,
        store_key: &str,
        params: &BucketParams,
        cost: f64,
    ) -> Result<BucketDecision> {
        match tokio::time::timeout(self.timeout, self.store.consume(store_key, params, cost)).await {
            Ok(result) => result,
            Err(_) => Err(TollboothError::StoreTimeout {
                operation: "consume",
                elapsed_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn degraded(&self, params: &BucketParams) -> BucketOutcome {
        let now = self.local_clock.now();
        match self.policy {
            FailurePolicy::Open => BucketOutcome {
                allowed: true,
                tokens_remaining: None,
                reset_at: now + params.window_secs as f64,
                now,
                degraded: true,
            },
            FailurePolicy::Closed => BucketOutcome {
                allowed: false,
                tokens_remaining: None,
                reset_at: now + FAIL_CLOSED_RETRY_SECS,
                now,
                degraded: true,
            },
        }
    }
}
