//! Administrative operations.
//!
//! Every read goes straight to the counter store and every write to the
//! live configuration; nothing here is cached, so what an operator sees is
//! what the next request will see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{Result, TollboothError};
use crate::ratelimit::bucket::BucketState;
use crate::ratelimit::{
    resolve_with, FailurePolicy, Identity, LimitDefinition, LimitTarget, RateLimiter, Role,
    ScopeKey, StatsSnapshot, Subject, TimeWindow,
};

/// Time budget for a single admin store operation. Scans touch every
/// live key, so this is far looser than the request-path budget.
pub const ADMIN_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumers listed in the global status unless the caller asks otherwise.
pub const DEFAULT_TOP_CONSUMERS: usize = 10;

/// Usage of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    /// `global` or the endpoint path
    pub scope: String,
    pub window: TimeWindow,
    pub limit: u64,
    pub capacity: f64,
    pub remaining: f64,
    /// Epoch seconds at which the bucket is full again
    pub reset_at: f64,
    pub usage_percent: f64,
    /// False for configured windows the caller has not touched yet
    pub tracked: bool,
}

impl WindowStatus {
    fn from_state(key: &ScopeKey, state: &BucketState, now: f64) -> Self {
        Self {
            scope: key.scope.to_string(),
            window: key.window,
            limit: state.limit,
            capacity: state.capacity,
            remaining: state.refilled_at(now),
            reset_at: state.full_at(now),
            usage_percent: state.usage_percent(now),
            tracked: true,
        }
    }

    fn untouched(key: &ScopeKey, definition: &LimitDefinition, now: f64) -> Self {
        Self {
            scope: key.scope.to_string(),
            window: key.window,
            limit: definition.limit,
            capacity: definition.burst_capacity(),
            remaining: definition.burst_capacity(),
            reset_at: now,
            usage_percent: 0.0,
            tracked: false,
        }
    }
}

/// Per-window detail for one identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub identity: String,
    pub role: Role,
    pub whitelisted: bool,
    pub windows: Vec<WindowStatus>,
    pub generated_at: DateTime<Utc>,
}

/// The most heavily used bucket of one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerUsage {
    pub identity: String,
    pub scope: String,
    pub window: TimeWindow,
    pub limit: u64,
    pub remaining: f64,
    pub usage_percent: f64,
}

/// Aggregate view of the whole deployment.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatus {
    pub tracked_identities: usize,
    pub tracked_keys: usize,
    pub config_version: u64,
    pub backend: &'static str,
    pub failure_policy: FailurePolicy,
    pub global_limits: Vec<LimitDefinition>,
    pub global_usage: Vec<WindowStatus>,
    pub top_consumers: Vec<ConsumerUsage>,
    /// Decisions taken by this process since start
    pub stats: StatsSnapshot,
    pub generated_at: DateTime<Utc>,
}

/// A runtime limit change.
///
/// Exactly one of `role`, `endpoint` or `global` selects the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub global: bool,
    pub window: TimeWindow,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_multiplier: Option<f64>,
}

impl ConfigUpdate {
    /// The table this update applies to.
    pub fn target(&self) -> Result<LimitTarget> {
        match (&self.role, &self.endpoint, self.global) {
            (Some(role), None, false) => Ok(LimitTarget::Role(role.clone())),
            (None, Some(endpoint), false) => Ok(LimitTarget::Endpoint(endpoint.clone())),
            (None, None, true) => Ok(LimitTarget::Global),
            _ => Err(TollboothError::ConfigurationInvalid(
                "update must name exactly one of role, endpoint or global".to_string(),
            )),
        }
    }
}

/// Operator-facing control surface over a running limiter.
pub struct AdminService {
    limiter: Arc<RateLimiter>,
    limits_path: Option<PathBuf>,
}

impl AdminService {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            limits_path: None,
        }
    }

    /// Rules file re-read by [`reload_configuration`](Self::reload_configuration).
    pub fn with_limits_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.limits_path = Some(path.into());
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Aggregate status: tracked identities, the global limit and its
    /// usage, and the `top_n` heaviest consumers.
    pub async fn global_status(&self, top_n: usize) -> Result<GlobalStatus> {
        let now = self.now().await?;
        let buckets = self.tracked(&self.prefix()).await?;
        let snapshot = self.limiter.config().snapshot();

        let mut identities = HashSet::new();
        let mut global_usage = Vec::new();
        for (key, state) in &buckets {
            match &key.subject {
                Subject::Identity(identity) => {
                    identities.insert(identity.clone());
                }
                Subject::Everyone => global_usage.push(WindowStatus::from_state(key, state, now)),
            }
        }
        global_usage.sort_by_key(|status| status.window);

        Ok(GlobalStatus {
            tracked_identities: identities.len(),
            tracked_keys: buckets.len(),
            config_version: snapshot.version,
            backend: self.limiter.engine().store().backend(),
            failure_policy: self.limiter.engine().policy(),
            global_limits: snapshot.rules.definitions(&snapshot.rules.global).collect(),
            global_usage,
            top_consumers: rank_consumers(&buckets, None, now, top_n),
            stats: self.limiter.stats(),
            generated_at: Utc::now(),
        })
    }

    /// Per-window status for one identity under `role`.
    ///
    /// Lists every stored bucket of the identity, plus the role's
    /// configured windows it has not used yet (reported as full).
    pub async fn identity_status(&self, identity: &Identity, role: &Role) -> Result<IdentityStatus> {
        let now = self.now().await?;
        let subject = Subject::Identity(identity.clone());
        let prefix = ScopeKey::subject_prefix(self.limiter.engine().key_prefix(), &subject);
        let snapshot = self.limiter.config().snapshot();

        let mut windows: Vec<WindowStatus> = self
            .tracked(&prefix)
            .await?
            .iter()
            .filter(|(key, _)| key.subject == subject)
            .map(|(key, state)| WindowStatus::from_state(key, state, now))
            .collect();

        for check in resolve_with(&snapshot.rules, identity, role, "") {
            if check.key.subject != subject {
                continue;
            }
            let scope = check.key.scope.to_string();
            let seen = windows
                .iter()
                .any(|w| w.scope == scope && w.window == check.key.window);
            if !seen {
                windows.push(WindowStatus::untouched(&check.key, &check.definition, now));
            }
        }
        windows.sort_by(|a, b| a.scope.cmp(&b.scope).then(a.window.cmp(&b.window)));

        Ok(IdentityStatus {
            identity: identity.to_string(),
            role: role.clone(),
            whitelisted: snapshot.rules.is_whitelisted(identity),
            windows,
            generated_at: Utc::now(),
        })
    }

    /// Identities ranked by usage of their `window` buckets, heaviest first.
    ///
    /// Computed from a scan of live keys, so a reset or an expiry shows up
    /// on the next call.
    pub async fn list_abusers(&self, window: TimeWindow, n: usize) -> Result<Vec<ConsumerUsage>> {
        let now = self.now().await?;
        let buckets = self.tracked(&self.prefix()).await?;
        Ok(rank_consumers(&buckets, Some(window), now, n))
    }

    /// Delete every bucket of `identity`, across all scopes and windows.
    ///
    /// The identity's next request starts from full burst capacity.
    pub async fn reset_identity(&self, identity: &Identity) -> Result<usize> {
        let subject = Subject::Identity(identity.clone());
        let prefix = ScopeKey::subject_prefix(self.limiter.engine().key_prefix(), &subject);

        let keys: Vec<String> = self
            .tracked(&prefix)
            .await?
            .into_iter()
            .filter(|(key, _)| key.subject == subject)
            .map(|(key, _)| key.to_store_key(self.limiter.engine().key_prefix()))
            .collect();

        if keys.is_empty() {
            info!(identity = %identity, "Reset requested for identity with no tracked keys");
            return Ok(0);
        }

        let store = self.limiter.engine().store();
        let deleted = self.bounded("delete", store.delete(&keys)).await?;
        info!(identity = %identity, deleted = deleted, "Identity rate limit state reset");
        Ok(deleted)
    }

    /// Apply a runtime limit change, returning the new config version.
    pub async fn update_configuration(&self, update: &ConfigUpdate) -> Result<u64> {
        let target = update.target()?;
        self.limiter
            .config()
            .update_limit(&target, update.window, update.limit, update.burst_multiplier)
    }

    /// Re-read the rules file and swap it in.
    pub async fn reload_configuration(&self) -> Result<u64> {
        let path = self.limits_path.as_ref().ok_or_else(|| {
            TollboothError::Config("no limits file configured to reload".to_string())
        })?;
        let rules = crate::ratelimit::LimitRules::from_file(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Rules reload failed, keeping previous configuration");
            e
        })?;
        self.limiter.config().replace(rules)
    }

    fn prefix(&self) -> String {
        self.limiter.engine().key_prefix().to_string()
    }

    async fn now(&self) -> Result<f64> {
        let store = self.limiter.engine().store();
        self.bounded("now", store.now()).await
    }

    /// Live buckets under `prefix` with parseable keys.
    async fn tracked(&self, prefix: &str) -> Result<Vec<(ScopeKey, BucketState)>> {
        let store = self.limiter.engine().store();
        let key_prefix = self.limiter.engine().key_prefix();
        let records = self.bounded("scan", store.scan(prefix)).await?;

        Ok(records
            .into_iter()
            .filter_map(|(key, state)| {
                ScopeKey::from_store_key(&key, key_prefix).map(|parsed| (parsed, state))
            })
            .collect())
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        match tokio::time::timeout(ADMIN_STORE_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(TollboothError::StoreTimeout {
                operation,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

/// Heaviest bucket per identity, ranked by usage (then fewest tokens left).
/// Idle identities are left out.
fn rank_consumers(
    buckets: &[(ScopeKey, BucketState)],
    window: Option<TimeWindow>,
    now: f64,
    n: usize,
) -> Vec<ConsumerUsage> {
    let mut heaviest: HashMap<&Identity, ConsumerUsage> = HashMap::new();

    for (key, state) in buckets {
        let Some(identity) = key.subject.identity() else {
            continue;
        };
        if window.is_some_and(|w| w != key.window) {
            continue;
        }
        let usage = ConsumerUsage {
            identity: identity.to_string(),
            scope: key.scope.to_string(),
            window: key.window,
            limit: state.limit,
            remaining: state.refilled_at(now),
            usage_percent: state.usage_percent(now),
        };
        if usage.usage_percent <= 0.0 {
            continue;
        }
        match heaviest.get(identity) {
            Some(current) if current.usage_percent >= usage.usage_percent => {}
            _ => {
                heaviest.insert(identity, usage);
            }
        }
    }

    let mut ranked: Vec<ConsumerUsage> = heaviest.into_values().collect();
    ranked.sort_by(|a, b| {
        b.usage_percent
            .total_cmp(&a.usage_percent)
            .then(a.remaining.total_cmp(&b.remaining))
            .then_with(|| a.identity.cmp(&b.identity))
    });
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ConfigHandle, LimitRules, TokenBucketEngine};
    use crate::store::{CounterStore, ManualClock, MemoryStore};

    fn rules() -> LimitRules {
        let mut rules = LimitRules::new();
        rules.burst_multiplier = 1.0;
        rules.set_limit(&LimitTarget::Role(Role::Viewer), TimeWindow::Minute, 10, None);
        rules.set_limit(&LimitTarget::Role(Role::Viewer), TimeWindow::Hour, 100, None);
        rules.set_limit(&LimitTarget::Global, TimeWindow::Minute, 1000, None);
        rules
    }

    fn service() -> (AdminService, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1000.0));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let engine = TokenBucketEngine::new(store.clone(), FailurePolicy::Closed);
        let config = Arc::new(ConfigHandle::new(rules()).unwrap());
        let limiter = Arc::new(RateLimiter::new(config, engine));
        (AdminService::new(limiter), store)
    }

    fn user(id: &str) -> Identity {
        Identity::User(id.to_string())
    }

    async fn hit(admin: &AdminService, id: &str, times: usize) {
        for _ in 0..times {
            admin.limiter().check(&user(id), &Role::Viewer, "/", 1).await;
        }
    }

    #[tokio::test]
    async fn test_global_status_counts_identities_and_keys() {
        let (admin, _) = service();
        hit(&admin, "alice", 3).await;
        hit(&admin, "bob", 8).await;

        let status = admin.global_status(DEFAULT_TOP_CONSUMERS).await.unwrap();
        assert_eq!(status.tracked_identities, 2);
        // two windows per identity plus the global minute bucket
        assert_eq!(status.tracked_keys, 5);
        assert_eq!(status.config_version, 1);
        assert_eq!(status.global_limits.len(), 1);
        assert_eq!(status.global_usage.len(), 1);
        assert_eq!(status.top_consumers[0].identity, "bob");
        assert_eq!(status.stats.checks, 11);
    }

    #[tokio::test]
    async fn test_identity_status_includes_untouched_windows() {
        let (admin, _) = service();
        hit(&admin, "alice", 4).await;

        let status = admin.identity_status(&user("alice"), &Role::Viewer).await.unwrap();
        assert_eq!(status.windows.len(), 2);
        let minute = status
            .windows
            .iter()
            .find(|w| w.window == TimeWindow::Minute)
            .unwrap();
        assert!(minute.tracked);
        assert!((minute.remaining - 6.0).abs() < 1e-9);
        assert!((minute.usage_percent - 40.0).abs() < 1e-9);

        let fresh = admin.identity_status(&user("carol"), &Role::Viewer).await.unwrap();
        assert_eq!(fresh.windows.len(), 2);
        assert!(fresh.windows.iter().all(|w| !w.tracked && w.usage_percent == 0.0));
    }

    #[tokio::test]
    async fn test_list_abusers_ranks_by_usage() {
        let (admin, _) = service();
        hit(&admin, "light", 1).await;
        hit(&admin, "heavy", 9).await;
        hit(&admin, "medium", 5).await;

        let abusers = admin.list_abusers(TimeWindow::Minute, 2).await.unwrap();
        let names: Vec<_> = abusers.iter().map(|a| a.identity.as_str()).collect();
        assert_eq!(names, vec!["heavy", "medium"]);
        assert_eq!(abusers[0].window, TimeWindow::Minute);
    }

    #[tokio::test]
    async fn test_reset_identity_is_exact_and_immediate() {
        let (admin, store) = service();
        hit(&admin, "alice", 10).await;
        hit(&admin, "alice2", 1).await;
        assert!(!admin.limiter().check(&user("alice"), &Role::Viewer, "/", 1).await.allowed);

        let deleted = admin.reset_identity(&user("alice")).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("rl:u:alice2|global|minute").is_some());

        let abusers = admin.list_abusers(TimeWindow::Minute, 10).await.unwrap();
        assert!(abusers.iter().all(|a| a.identity != "alice"));

        let result = admin.limiter().check(&user("alice"), &Role::Viewer, "/", 1).await;
        assert!(result.allowed);
        assert!((result.remaining - 9.0).abs() < 1e-9);

        assert_eq!(admin.reset_identity(&user("nobody")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_configuration() {
        let (admin, _) = service();
        let update = ConfigUpdate {
            role: Some(Role::Viewer),
            endpoint: None,
            global: false,
            window: TimeWindow::Minute,
            limit: 3,
            burst_multiplier: None,
        };
        assert_eq!(admin.update_configuration(&update).await.unwrap(), 2);

        hit(&admin, "dave", 3).await;
        assert!(!admin.limiter().check(&user("dave"), &Role::Viewer, "/", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_previous_version() {
        let (admin, _) = service();
        let zero = ConfigUpdate {
            role: None,
            endpoint: Some("/api/search".to_string()),
            global: false,
            window: TimeWindow::Second,
            limit: 0,
            burst_multiplier: None,
        };
        assert!(matches!(
            admin.update_configuration(&zero).await,
            Err(TollboothError::ConfigurationInvalid(_))
        ));

        let ambiguous = ConfigUpdate {
            role: Some(Role::Viewer),
            global: true,
            limit: 5,
            ..zero
        };
        assert!(admin.update_configuration(&ambiguous).await.is_err());
        assert_eq!(admin.limiter().config().version(), 1);
    }

    #[tokio::test]
    async fn test_reload_without_path_fails() {
        let (admin, _) = service();
        assert!(matches!(
            admin.reload_configuration().await,
            Err(TollboothError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let path = std::env::temp_dir().join(format!("tollbooth-reload-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "burst_multiplier: 1.0\nroles:\n  viewer:\n    minute:\n      limit: 2\nwhitelist: [ops-bot]\n",
        )
        .unwrap();

        let (admin, store) = service();
        let admin = admin.with_limits_path(&path);
        assert_eq!(admin.reload_configuration().await.unwrap(), 2);

        let ops = admin.limiter().check(&user("ops-bot"), &Role::Viewer, "/", 1).await;
        assert!(ops.allowed);
        assert_eq!(store.scan("rl:u:ops-bot|").await.unwrap().len(), 0);

        hit(&admin, "erin", 2).await;
        assert!(!admin.limiter().check(&user("erin"), &Role::Viewer, "/", 1).await.allowed);

        std::fs::remove_file(&path).ok();
    }
}
