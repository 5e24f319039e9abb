//! Rate limiting logic: bucket arithmetic, limit resolution and the
//! request-path façade.

pub mod bucket;
mod engine;
mod identity;
mod key;
mod limiter;
mod resolver;
mod rules;
mod snapshot;
mod window;

pub use engine::{BucketOutcome, FailurePolicy, TokenBucketEngine, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use identity::{Identity, Role};
pub use key::{Scope, ScopeKey, Subject};
pub use limiter::{
    LimiterStats, RateLimitDenial, RateLimitResult, RateLimiter, StatsSnapshot, RATE_LIMIT_EXCEEDED,
};
pub use resolver::{resolve_with, role_limits, LimitCheck, LimitResolver, Resolution};
pub use rules::{
    LimitDefinition, LimitRules, LimitSpec, LimitTarget, WindowLimits, DEFAULT_BURST_MULTIPLIER,
};
pub use snapshot::{ConfigHandle, RulesSnapshot};
pub use window::TimeWindow;
