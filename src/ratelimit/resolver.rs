//! Limit resolution: which buckets a request must pass.

use std::sync::Arc;
use tracing::trace;

use super::identity::{Identity, Role};
use super::key::ScopeKey;
use super::rules::{LimitDefinition, LimitRules, WindowLimits};
use super::snapshot::ConfigHandle;

/// One bucket to check and the limit it enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitCheck {
    pub key: ScopeKey,
    pub definition: LimitDefinition,
}

/// Outcome of resolving one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Exempt from every limit.
    Whitelisted,
    /// Buckets to pass; empty when no limit applies.
    Checks(Vec<LimitCheck>),
}

/// Resolves requests against the live configuration.
#[derive(Debug, Clone)]
pub struct LimitResolver {
    config: Arc<ConfigHandle>,
}

impl LimitResolver {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    /// Resolve against the snapshot in effect right now.
    pub fn resolve(&self, identity: &Identity, role: &Role, endpoint: &str) -> Resolution {
        let snapshot = self.config.snapshot();
        if snapshot.rules.is_whitelisted(identity) {
            trace!(identity = %identity, version = snapshot.version, "Whitelisted");
            return Resolution::Whitelisted;
        }

        let checks = resolve_with(&snapshot.rules, identity, role, endpoint);
        trace!(
            identity = %identity,
            role = %role,
            endpoint = %endpoint,
            checks = checks.len(),
            version = snapshot.version,
            "Resolved limits"
        );
        Resolution::Checks(checks)
    }
}

/// Limits that apply to `role`. Roles without a table of their own get
/// the anonymous table.
pub fn role_limits<'a>(rules: &'a LimitRules, role: &Role) -> Option<&'a WindowLimits> {
    rules
        .roles
        .get(role)
        .or_else(|| rules.roles.get(&Role::Anonymous))
}

/// Resolve a request to the list of buckets it must pass.
///
/// 1. whitelisted identities get no checks at all;
/// 2. an endpoint override contributes one check per window it defines;
/// 3. role limits contribute the windows the override does not define;
/// 4. every global window is always added.
pub fn resolve_with(
    rules: &LimitRules,
    identity: &Identity,
    role: &Role,
    endpoint: &str,
) -> Vec<LimitCheck> {
    if rules.is_whitelisted(identity) {
        return Vec::new();
    }

    let mut checks = Vec::new();

    let overrides = if endpoint.is_empty() {
        None
    } else {
        rules.endpoints.get(endpoint)
    };

    if let Some(overrides) = overrides {
        checks.extend(rules.definitions(overrides).map(|definition| LimitCheck {
            key: ScopeKey::endpoint(identity, endpoint, definition.window),
            definition,
        }));
    }

    if let Some(limits) = role_limits(rules, role) {
        checks.extend(
            rules
                .definitions(limits)
                .filter(|definition| {
                    overrides.map_or(true, |o| !o.contains_key(&definition.window))
                })
                .map(|definition| LimitCheck {
                    key: ScopeKey::identity(identity, definition.window),
                    definition,
                }),
        );
    }

    checks.extend(rules.definitions(&rules.global).map(|definition| LimitCheck {
        key: ScopeKey::global(definition.window),
        definition,
    }));

    checks
}
