//! Token bucket arithmetic.
//!
//! Everything here is pure: given the prior state of a bucket and the
//! current time it computes the refill, the consumption and the new state.
//! Stores run [`transact`] (or an equivalent server-side script) inside
//! their per-key atomic section.

use serde::{Deserialize, Serialize};

use super::rules::LimitDefinition;

/// Parameters of the bucket being checked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Tokens refilled per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Maximum tokens the bucket may hold
    pub capacity: f64,
}

impl BucketParams {
    pub fn from_definition(definition: &LimitDefinition) -> Self {
        Self {
            limit: definition.limit,
            window_secs: definition.window.as_secs(),
            capacity: definition.burst_capacity(),
        }
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window_secs as f64
    }

    /// How long an idle bucket must be kept.
    ///
    /// After refilling from empty to full an absent record and a stored
    /// one are indistinguishable, so that is when the record may expire.
    pub fn ttl_secs(&self) -> u64 {
        let to_full = (self.capacity * self.window_secs as f64 / self.limit as f64).ceil() as u64;
        to_full.max(self.window_secs)
    }
}

/// Persisted state of one bucket.
///
/// Records carry their own parameters so they can be inspected without
/// the configuration that created them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    /// Store clock, epoch seconds
    pub last_update: f64,
    pub limit: u64,
    pub window_secs: u64,
    pub capacity: f64,
}

impl BucketState {
    /// A bucket seen for the first time: full.
    pub fn fresh(params: &BucketParams, now: f64) -> Self {
        Self {
            tokens: params.capacity,
            last_update: now,
            limit: params.limit,
            window_secs: params.window_secs,
            capacity: params.capacity,
        }
    }

    fn refill_rate(&self) -> f64 {
        if self.window_secs == 0 {
            return 0.0;
        }
        self.limit as f64 / self.window_secs as f64
    }

    /// Tokens the bucket would hold at `now` with no consumption.
    pub fn refilled_at(&self, now: f64) -> f64 {
        let elapsed = (now - self.last_update).max(0.0);
        (self.tokens + elapsed * self.refill_rate()).min(self.capacity)
    }

    /// Share of the burst capacity in use at `now`, 0–100.
    pub fn usage_percent(&self, now: f64) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        let used = self.capacity - self.refilled_at(now);
        (used / self.capacity * 100.0).clamp(0.0, 100.0)
    }

    /// Epoch seconds at which the bucket is full again.
    pub fn full_at(&self, now: f64) -> f64 {
        let rate = self.refill_rate();
        if rate <= 0.0 {
            return now;
        }
        now + (self.capacity - self.refilled_at(now)).max(0.0) / rate
    }
}

/// Outcome of one transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    /// Tokens left after this transaction
    pub tokens_remaining: f64,
    /// Informational reset time, epoch seconds
    pub reset_at: f64,
    /// Store clock at which the transaction ran
    pub now: f64,
}

/// Refill the bucket to `now`, then try to take `cost` tokens.
///
/// A missing prior state starts full. Consumption is all-or-nothing; the
/// refill is persisted on denial as well.
pub fn transact(
    prior: Option<&BucketState>,
    params: &BucketParams,
    cost: f64,
    now: f64,
) -> (BucketState, BucketDecision) {
    let (tokens, last_update) = match prior {
        Some(state) => (state.tokens, state.last_update),
        None => (params.capacity, now),
    };

    let elapsed = (now - last_update).max(0.0);
    let mut tokens = (tokens + elapsed * params.refill_rate()).min(params.capacity);

    let allowed = tokens >= cost;
    if allowed {
        tokens -= cost;
    }

    let state = BucketState {
        tokens,
        last_update: now,
        limit: params.limit,
        window_secs: params.window_secs,
        capacity: params.capacity,
    };
    let decision = decide(allowed, tokens, params, cost, now);
    (state, decision)
}

/// Build the decision for a transaction that left `tokens` in the bucket.
///
/// Shared with stores that run the arithmetic server-side.
pub fn decide(
    allowed: bool,
    tokens: f64,
    params: &BucketParams,
    cost: f64,
    now: f64,
) -> BucketDecision {
    let reset_at = if allowed {
        now + params.window_secs as f64
    } else {
        now + (cost - tokens) * params.window_secs as f64 / params.limit as f64
    };

    BucketDecision {
        allowed,
        tokens_remaining: tokens,
        reset_at,
        now,
    }
}
