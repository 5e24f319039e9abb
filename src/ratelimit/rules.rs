//! Rate limit rules configuration and validation.
//!
//! This module handles loading the limit tables (per-role, per-endpoint,
//! global) and the whitelist from YAML, and rejects definitions that would
//! produce an unusable bucket.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

use super::identity::{Identity, Role};
use super::window::TimeWindow;
use crate::error::{Result, TollboothError};

/// Burst multiplier applied when neither the rule nor the table sets one.
pub const DEFAULT_BURST_MULTIPLIER: f64 = 2.0;

/// Limits keyed by window.
pub type WindowLimits = BTreeMap<TimeWindow, LimitSpec>;

/// A limit as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Tokens refilled per window
    pub limit: u64,
    /// Burst capacity as a multiple of `limit`; the table default applies if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_multiplier: Option<f64>,
}

impl LimitSpec {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            burst_multiplier: None,
        }
    }

    pub fn with_burst(limit: u64, burst_multiplier: f64) -> Self {
        Self {
            limit,
            burst_multiplier: Some(burst_multiplier),
        }
    }

    /// Resolve against the table-wide default multiplier.
    pub fn definition(&self, window: TimeWindow, default_multiplier: f64) -> LimitDefinition {
        LimitDefinition {
            window,
            limit: self.limit,
            burst_multiplier: self.burst_multiplier.unwrap_or(default_multiplier),
        }
    }
}

/// A fully resolved limit: what one bucket enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitDefinition {
    pub window: TimeWindow,
    pub limit: u64,
    pub burst_multiplier: f64,
}

impl LimitDefinition {
    /// Maximum tokens the bucket may hold.
    pub fn burst_capacity(&self) -> f64 {
        self.limit as f64 * self.burst_multiplier
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window.as_secs() as f64
    }

    /// Check the invariants every bucket relies on.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.limit == 0 {
            return Err("limit must be greater than zero".to_string());
        }
        if !self.burst_multiplier.is_finite() {
            return Err("burst multiplier must be a finite number".to_string());
        }
        if self.burst_capacity() < self.limit as f64 {
            return Err(format!(
                "burst capacity {} is below limit {} (multiplier {} < 1)",
                self.burst_capacity(),
                self.limit,
                self.burst_multiplier
            ));
        }
        Ok(())
    }
}

/// What a runtime configuration change applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitTarget {
    Role(Role),
    Endpoint(String),
    Global,
}

impl std::fmt::Display for LimitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitTarget::Role(role) => write!(f, "role {}", role),
            LimitTarget::Endpoint(path) => write!(f, "endpoint {}", path),
            LimitTarget::Global => f.write_str("global"),
        }
    }
}

/// The complete limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRules {
    /// Default burst multiplier for rules that do not set their own
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,

    /// Role name to per-window limits
    #[serde(default)]
    pub roles: BTreeMap<Role, WindowLimits>,

    /// Endpoint path to per-window limits that supersede role limits there
    #[serde(default)]
    pub endpoints: BTreeMap<String, WindowLimits>,

    /// Limits shared by every caller
    #[serde(default)]
    pub global: WindowLimits,

    /// Identities (user ids or addresses) exempt from every check
    #[serde(default)]
    pub whitelist: BTreeSet<String>,
}

fn default_burst_multiplier() -> f64 {
    DEFAULT_BURST_MULTIPLIER
}

impl Default for LimitRules {
    fn default() -> Self {
        Self {
            burst_multiplier: DEFAULT_BURST_MULTIPLIER,
            roles: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            global: BTreeMap::new(),
            whitelist: BTreeSet::new(),
        }
    }
}

impl LimitRules {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: LimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| TollboothError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject any definition with `limit == 0` or `burst_capacity < limit`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |path: String, reason: String| {
            TollboothError::ConfigurationInvalid(format!("{}: {}", path, reason))
        };

        if !self.burst_multiplier.is_finite() || self.burst_multiplier < 1.0 {
            return Err(invalid(
                "burst_multiplier".to_string(),
                format!("must be at least 1.0, got {}", self.burst_multiplier),
            ));
        }

        let tables = self
            .roles
            .iter()
            .map(|(role, limits)| (format!("roles.{}", role), limits))
            .chain(
                self.endpoints
                    .iter()
                    .map(|(path, limits)| (format!("endpoints.{}", path), limits)),
            )
            .chain(std::iter::once(("global".to_string(), &self.global)));

        for (table, limits) in tables {
            for (window, spec) in limits {
                spec.definition(*window, self.burst_multiplier)
                    .validate()
                    .map_err(|reason| invalid(format!("{}.{}", table, window), reason))?;
            }
        }

        if self.endpoints.keys().any(|path| path.trim().is_empty()) {
            return Err(invalid(
                "endpoints".to_string(),
                "endpoint path must not be empty".to_string(),
            ));
        }
        if self.whitelist.iter().any(|entry| entry.trim().is_empty()) {
            return Err(invalid(
                "whitelist".to_string(),
                "entries must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the identity is exempt from all checks.
    ///
    /// Address entries (`10.0.0.1` or `ip:10.0.0.1`) only match anonymous
    /// callers; other entries (`ops-bot`) only match user ids.
    pub fn is_whitelisted(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Ip(addr) => {
                self.whitelist.contains(addr.as_str()) || self.whitelist.contains(&identity.to_string())
            }
            Identity::User(id) => !looks_like_address(id) && self.whitelist.contains(id.as_str()),
        }
    }

    /// Resolved definitions for a limit table.
    pub fn definitions<'a>(
        &'a self,
        limits: &'a WindowLimits,
    ) -> impl Iterator<Item = LimitDefinition> + 'a {
        limits
            .iter()
            .map(move |(window, spec)| spec.definition(*window, self.burst_multiplier))
    }

    /// Set one window of one table, creating the table if needed.
    pub fn set_limit(
        &mut self,
        target: &LimitTarget,
        window: TimeWindow,
        limit: u64,
        burst_multiplier: Option<f64>,
    ) {
        let table = match target {
            LimitTarget::Role(role) => self.roles.entry(role.clone()).or_default(),
            LimitTarget::Endpoint(path) => self.endpoints.entry(path.clone()).or_default(),
            LimitTarget::Global => &mut self.global,
        };
        table.insert(
            window,
            LimitSpec {
                limit,
                burst_multiplier,
            },
        );
    }
}

fn looks_like_address(raw: &str) -> bool {
    raw.starts_with("ip:") || raw.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
burst_multiplier: 2.0
roles:
  viewer:
    minute:
      limit: 100
    hour:
      limit: 1000
      burst_multiplier: 1.0
  anonymous:
    minute:
      limit: 20
endpoints:
  /api/search:
    second:
      limit: 5
global:
  minute:
    limit: 10000
whitelist:
  - 10.0.0.1
  - ops-bot
"#;

    #[test]
    fn test_parse_rules() {
        let rules = LimitRules::from_yaml(SAMPLE).unwrap();
        assert_eq!(rules.roles.len(), 2);
        assert_eq!(rules.roles[&Role::Viewer][&TimeWindow::Minute].limit, 100);
        assert_eq!(rules.endpoints["/api/search"][&TimeWindow::Second].limit, 5);
        assert_eq!(rules.global[&TimeWindow::Minute].limit, 10000);
        assert!(rules.whitelist.contains("ops-bot"));
    }

    #[test]
    fn test_definition_uses_table_default_burst() {
        let rules = LimitRules::from_yaml(SAMPLE).unwrap();
        let viewer = &rules.roles[&Role::Viewer];

        let defs: Vec<LimitDefinition> = rules.definitions(viewer).collect();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].window, TimeWindow::Minute);
        assert_eq!(defs[0].burst_capacity(), 200.0);
        assert_eq!(defs[1].window, TimeWindow::Hour);
        assert_eq!(defs[1].burst_capacity(), 1000.0);
    }

    #[test]
    fn test_empty_document_is_default() {
        let rules = LimitRules::from_yaml("{}").unwrap();
        assert_eq!(rules, LimitRules::default());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = r#"
roles:
  viewer:
    minute:
      limit: 0
"#;
        let err = LimitRules::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TollboothError::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("roles.viewer.minute"));
    }

    #[test]
    fn test_burst_below_limit_rejected() {
        let yaml = r#"
global:
  hour:
    limit: 100
    burst_multiplier: 0.5
"#;
        let err = LimitRules::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("global.hour"));
    }

    #[test]
    fn test_unknown_window_rejected() {
        let yaml = r#"
roles:
  viewer:
    fortnight:
      limit: 10
"#;
        assert!(matches!(
            LimitRules::from_yaml(yaml),
            Err(TollboothError::Config(_))
        ));
    }

    #[test]
    fn test_whitelist_matches_value_and_key_form() {
        let mut rules = LimitRules::new();
        rules.whitelist.insert("10.0.0.1".to_string());
        rules.whitelist.insert("ip:10.0.0.2".to_string());
        rules.whitelist.insert("ops-bot".to_string());

        assert!(rules.is_whitelisted(&Identity::Ip("10.0.0.1".to_string())));
        assert!(rules.is_whitelisted(&Identity::Ip("10.0.0.2".to_string())));
        assert!(rules.is_whitelisted(&Identity::User("ops-bot".to_string())));
        assert!(!rules.is_whitelisted(&Identity::User("alice".to_string())));
    }

    #[test]
    fn test_whitelisted_address_cannot_be_claimed_as_user_id() {
        let mut rules = LimitRules::new();
        rules.whitelist.insert("10.0.0.1".to_string());
        rules.whitelist.insert("ip:10.0.0.2".to_string());

        assert!(!rules.is_whitelisted(&Identity::User("10.0.0.1".to_string())));
        assert!(!rules.is_whitelisted(&Identity::User("ip:10.0.0.2".to_string())));
    }

    #[test]
    fn test_set_limit_creates_table() {
        let mut rules = LimitRules::new();
        rules.set_limit(
            &LimitTarget::Endpoint("/api/export".to_string()),
            TimeWindow::Hour,
            10,
            Some(1.0),
        );
        assert_eq!(
            rules.endpoints["/api/export"][&TimeWindow::Hour],
            LimitSpec::with_burst(10, 1.0)
        );
        assert!(rules.validate().is_ok());
    }
}
