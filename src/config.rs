//! Configuration management for Tollbooth.
//!
//! Service settings come from an optional YAML/TOML file overlaid with
//! `TOLLBOOTH__*` environment variables (e.g. `TOLLBOOTH__STORE__URL`,
//! `TOLLBOOTH__FAILURE_POLICY`). Limit tables live in a separate rules file
//! (see [`LimitRules`](crate::ratelimit::LimitRules)) so they can be
//! reloaded at runtime.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TollboothError};
use crate::ratelimit::{
    ConfigHandle, FailurePolicy, LimitRules, RateLimiter, TokenBucketEngine, DEFAULT_KEY_PREFIX,
};
use crate::store::{CounterStore, MemoryStore, RedisStore};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "TOLLBOOTH";

/// Main configuration for the Tollbooth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollboothConfig {
    /// Admin server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Behaviour when the store is unreachable. Has no default: every
    /// deployment must choose.
    pub failure_policy: FailurePolicy,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub limits_path: Option<PathBuf>,
}

/// Admin server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admin API address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,

    /// Bearer token required by the admin API (unset = no authentication)
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_addr: default_admin_addr(),
            admin_token: None,
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only correct for a single worker
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection URL for networked backends
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-transaction time budget in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

impl TollboothConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading service configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TollboothConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollboothConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollboothError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the limits file, or start with no limits if none is set.
    pub fn load_rules(&self) -> Result<LimitRules> {
        match &self.limits_path {
            Some(path) => LimitRules::from_file(path),
            None => {
                warn!("No limits_path configured, starting without rate limits");
                Ok(LimitRules::new())
            }
        }
    }

    /// Open the configured counter store.
    pub async fn connect_store(&self) -> Result<Arc<dyn CounterStore>> {
        let store: Arc<dyn CounterStore> = match self.store.backend {
            StoreBackend::Memory => {
                warn!("Using in-process counter store; limits are not shared between workers");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Redis => Arc::new(RedisStore::connect(&self.store.url).await?),
        };
        Ok(store)
    }

    /// Wire store, engine and rules into a ready limiter.
    pub async fn build_limiter(&self) -> Result<Arc<RateLimiter>> {
        let rules = self.load_rules()?;
        let store = self.connect_store().await?;
        let engine = TokenBucketEngine::new(store, self.failure_policy)
            .with_timeout(self.store.timeout())
            .with_key_prefix(self.store.key_prefix.clone());
        let config = Arc::new(ConfigHandle::new(rules)?);

        info!(
            backend = engine.store().backend(),
            policy = %self.failure_policy,
            version = config.version(),
            "Rate limiter initialized"
        );
        Ok(Arc::new(RateLimiter::new(config, engine)))
    }

    fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(TollboothError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(TollboothError::Config(
                "store.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
