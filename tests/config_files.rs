//! The configuration files shipped in `config/` must load.

use std::path::PathBuf;

use tollbooth::config::{StoreBackend, TollboothConfig};
use tollbooth::ratelimit::{FailurePolicy, Identity, LimitRules, Role, TimeWindow};

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn sample_service_config_loads() {
    let path = config_dir().join("tollbooth.yaml");
    let config = TollboothConfig::from_file(path.to_str().unwrap()).unwrap();

    assert_eq!(config.store.backend, StoreBackend::Redis);
    assert_eq!(config.failure_policy, FailurePolicy::Open);
    assert!(config.limits_path.is_some());
}

#[test]
fn sample_limits_load() {
    let rules = LimitRules::from_file(config_dir().join("limits.yaml")).unwrap();

    assert_eq!(rules.roles[&Role::Viewer][&TimeWindow::Minute].limit, 100);
    assert_eq!(rules.endpoints["/api/search"].len(), 2);
    assert_eq!(rules.global[&TimeWindow::Minute].burst_multiplier, Some(1.0));
    assert!(rules.is_whitelisted(&Identity::Ip("127.0.0.1".to_string())));
    assert!(rules.is_whitelisted(&Identity::User("healthcheck-bot".to_string())));
}
