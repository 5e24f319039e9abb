//! Rate limiter façade.
//!
//! Resolves the buckets a request must pass, runs every bucket
//! transaction, and folds the outcomes into one decision. Holds no
//! per-request state, so any number of workers can share a store.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::engine::{BucketOutcome, TokenBucketEngine};
use super::identity::{Identity, Role};
use super::resolver::{LimitCheck, LimitResolver, Resolution};
use super::snapshot::ConfigHandle;
use super::window::TimeWindow;

/// `error_kind` of every denial body.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// Decision for one request, plus the metadata of its tightest limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Limit of the binding window; `None` when no limit applied
    pub limit: Option<u64>,
    /// Tokens left in the binding window; infinite when no limit applied
    pub remaining: f64,
    /// Epoch seconds
    pub reset_at: Option<f64>,
    /// Seconds to wait; only set on denial
    pub retry_after: Option<f64>,
    pub window: Option<TimeWindow>,
    /// Bucket that produced the metadata
    pub scope: Option<String>,
    /// At least one bucket was decided by the failure policy
    pub degraded: bool,
}

/// Structured denial body handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDenial {
    pub error_kind: String,
    pub limit: Option<u64>,
    /// Whole seconds, rounded up
    pub retry_after: u64,
    /// Epoch seconds, rounded up
    pub reset_at: u64,
}

impl RateLimitResult {
    /// Result for a request no limit applies to.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: f64::INFINITY,
            reset_at: None,
            retry_after: None,
            window: None,
            scope: None,
            degraded: false,
        }
    }

    /// Response headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(limit) = self.limit {
            headers.push(("X-RateLimit-Limit", limit.to_string()));
        }
        if self.remaining.is_finite() {
            headers.push((
                "X-RateLimit-Remaining",
                (self.remaining.max(0.0).floor() as u64).to_string(),
            ));
        }
        if let Some(reset_at) = self.reset_at {
            headers.push(("X-RateLimit-Reset", (reset_at.ceil() as u64).to_string()));
        }
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", (retry_after.ceil() as u64).to_string()));
        }
        headers
    }

    /// The denial body, if this request was denied.
    pub fn denial(&self) -> Option<RateLimitDenial> {
        if self.allowed {
            return None;
        }
        Some(RateLimitDenial {
            error_kind: RATE_LIMIT_EXCEEDED.to_string(),
            limit: self.limit,
            retry_after: self.retry_after.map_or(0, |r| r.ceil() as u64),
            reset_at: self.reset_at.map_or(0, |r| r.ceil() as u64),
        })
    }
}

/// Process-local decision counters.
#[derive(Debug, Default)]
pub struct LimiterStats {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
    whitelisted: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub degraded: u64,
    pub whitelisted: u64,
}

impl LimiterStats {
    fn record(&self, result: &RateLimitResult) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if result.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        if result.degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            whitelisted: self.whitelisted.load(Ordering::Relaxed),
        }
    }
}

/// The rate limiter shared by all request handlers of a worker.
pub struct RateLimiter {
    resolver: LimitResolver,
    engine: TokenBucketEngine,
    stats: LimiterStats,
}

impl RateLimiter {
    pub fn new(config: Arc<ConfigHandle>, engine: TokenBucketEngine) -> Self {
        Self {
            resolver: LimitResolver::new(config),
            engine,
            stats: LimiterStats::default(),
        }
    }

    pub fn resolver(&self) -> &LimitResolver {
        &self.resolver
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        self.resolver.config()
    }

    pub fn engine(&self) -> &TokenBucketEngine {
        &self.engine
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Check a request whose caller may not have been resolved.
    ///
    /// A missing user id falls back to the client address, a missing role
    /// to `anonymous`; neither is an error.
    pub async fn check_unresolved(
        &self,
        user_id: Option<&str>,
        role: Option<&str>,
        addr: Option<IpAddr>,
        endpoint: &str,
        cost: u32,
    ) -> RateLimitResult {
        let identity = Identity::resolve(user_id, addr);
        let role = Role::resolve(role);
        self.check(&identity, &role, endpoint, cost).await
    }

    /// Check a request and consume `cost` tokens from every applicable
    /// bucket.
    ///
    /// All buckets are consumed even when one denies; tokens taken from
    /// passing buckets are not given back.
    #[instrument(
        skip_all,
        fields(identity = %identity, role = %role, endpoint = %endpoint, cost = cost)
    )]
    pub async fn check(
        &self,
        identity: &Identity,
        role: &Role,
        endpoint: &str,
        cost: u32,
    ) -> RateLimitResult {
        let checks = match self.resolver.resolve(identity, role, endpoint) {
            Resolution::Whitelisted => {
                self.stats.whitelisted.fetch_add(1, Ordering::Relaxed);
                let result = RateLimitResult::unlimited();
                self.stats.record(&result);
                return result;
            }
            Resolution::Checks(checks) => checks,
        };
        if checks.is_empty() {
            let result = RateLimitResult::unlimited();
            self.stats.record(&result);
            return result;
        }

        let outcomes = join_all(checks.iter().map(|check| {
            self.engine
                .check_and_consume(&check.key, &check.definition, cost)
        }))
        .await;

        let result = aggregate(&checks, &outcomes);
        self.stats.record(&result);

        if !result.allowed {
            debug!(
                scope = ?result.scope,
                limit = ?result.limit,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
        }
        if result.degraded {
            warn!(allowed = result.allowed, "Rate limit decision degraded by store failure");
        }

        result
    }
}

/// Tokens a bucket outcome reports, with unknown counts ranked as
/// unconstrained when admitted and exhausted when denied.
fn effective_remaining(outcome: &BucketOutcome) -> f64 {
    outcome
        .tokens_remaining
        .unwrap_or(if outcome.allowed { f64::INFINITY } else { 0.0 })
}

/// Fold per-bucket outcomes into one decision.
///
/// Denied if any bucket denied. The metadata comes from the tightest
/// bucket: among denials the one with the fewest tokens (ties: longest
/// wait), otherwise the passing bucket with the fewest tokens (ties:
/// earliest reset).
fn aggregate(checks: &[LimitCheck], outcomes: &[BucketOutcome]) -> RateLimitResult {
    let allowed = outcomes.iter().all(|o| o.allowed);
    let degraded = outcomes.iter().any(|o| o.degraded);

    let binding = checks
        .iter()
        .zip(outcomes)
        .filter(|(_, outcome)| allowed || !outcome.allowed)
        .min_by(|(_, a), (_, b)| {
            effective_remaining(a)
                .partial_cmp(&effective_remaining(b))
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| {
                    let by_reset = a.reset_at.partial_cmp(&b.reset_at).unwrap_or(CmpOrdering::Equal);
                    if allowed {
                        by_reset
                    } else {
                        by_reset.reverse()
                    }
                })
        });

    let Some((check, outcome)) = binding else {
        return RateLimitResult::unlimited();
    };

    RateLimitResult {
        allowed,
        limit: Some(check.definition.limit),
        remaining: effective_remaining(outcome).max(0.0),
        reset_at: Some(outcome.reset_at),
        retry_after: (!allowed).then(|| (outcome.reset_at - outcome.now).max(0.0)),
        window: Some(check.definition.window),
        scope: Some(check.key.to_string()),
        degraded,
    }
}
