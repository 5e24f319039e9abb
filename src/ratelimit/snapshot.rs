//! Live limit configuration.
//!
//! The active rules are held as an immutable, versioned snapshot behind an
//! `Arc`. Readers clone the `Arc` and never see a partially applied
//! change; writers build a new snapshot and swap the reference.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

use super::rules::{LimitRules, LimitTarget};
use super::window::TimeWindow;
use crate::error::Result;

/// One immutable version of the limit rules.
#[derive(Debug)]
pub struct RulesSnapshot {
    /// Monotonically increasing version, starting at 1
    pub version: u64,
    pub rules: LimitRules,
}

/// Shared handle to the live configuration.
pub struct ConfigHandle {
    current: RwLock<Arc<RulesSnapshot>>,
    /// Serializes writers so read-modify-write updates do not lose changes.
    write_lock: Mutex<()>,
}

impl ConfigHandle {
    /// Validate `rules` and make them version 1.
    pub fn new(rules: LimitRules) -> Result<Self> {
        rules.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(RulesSnapshot { version: 1, rules })),
            write_lock: Mutex::new(()),
        })
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<RulesSnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Replace the whole rule set (e.g. after re-reading the rules file).
    ///
    /// Invalid rules are rejected and the previous snapshot stays active.
    pub fn replace(&self, rules: LimitRules) -> Result<u64> {
        let _guard = self.write_lock.lock();
        if let Err(e) = rules.validate() {
            warn!(error = %e, "Rejected rate limit rules, keeping previous configuration");
            return Err(e);
        }
        let version = self.swap(rules);
        info!(version = version, "Rate limit rules replaced");
        Ok(version)
    }

    /// Change one window of one limit table.
    pub fn update_limit(
        &self,
        target: &LimitTarget,
        window: TimeWindow,
        limit: u64,
        burst_multiplier: Option<f64>,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let mut rules = self.current.read().rules.clone();
        rules.set_limit(target, window, limit, burst_multiplier);

        if let Err(e) = rules.validate() {
            warn!(
                target = %target,
                window = %window,
                limit = limit,
                error = %e,
                "Rejected limit update, keeping previous configuration"
            );
            return Err(e);
        }

        let version = self.swap(rules);
        info!(
            target = %target,
            window = %window,
            limit = limit,
            version = version,
            "Limit updated"
        );
        Ok(version)
    }

    /// Install `rules` as the next version. Caller holds `write_lock`.
    fn swap(&self, rules: LimitRules) -> u64 {
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(RulesSnapshot { version, rules });
        version
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollboothError;
    use crate::ratelimit::identity::Role;
    use crate::ratelimit::rules::LimitSpec;

    fn viewer_rules() -> LimitRules {
        let mut rules = LimitRules::new();
        rules.set_limit(&LimitTarget::Role(Role::Viewer), TimeWindow::Minute, 100, None);
        rules
    }

    #[test]
    fn test_initial_version() {
        let handle = ConfigHandle::new(viewer_rules()).unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(
            handle.snapshot().rules.roles[&Role::Viewer][&TimeWindow::Minute],
            LimitSpec::new(100)
        );
    }

    #[test]
    fn test_update_bumps_version_and_keeps_old_snapshot_intact() {
        let handle = ConfigHandle::new(viewer_rules()).unwrap();
        let before = handle.snapshot();

        let version = handle
            .update_limit(&LimitTarget::Role(Role::Viewer), TimeWindow::Minute, 250, None)
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(before.rules.roles[&Role::Viewer][&TimeWindow::Minute].limit, 100);
        assert_eq!(
            handle.snapshot().rules.roles[&Role::Viewer][&TimeWindow::Minute].limit,
            250
        );
    }

    #[test]
    fn test_invalid_update_keeps_previous_configuration() {
        let handle = ConfigHandle::new(viewer_rules()).unwrap();

        let err = handle
            .update_limit(&LimitTarget::Global, TimeWindow::Hour, 0, None)
            .unwrap_err();

        assert!(matches!(err, TollboothError::ConfigurationInvalid(_)));
        assert_eq!(handle.version(), 1);
        assert!(handle.snapshot().rules.global.is_empty());
    }

    #[test]
    fn test_replace_rejects_invalid_rules() {
        let handle = ConfigHandle::new(viewer_rules()).unwrap();
        let mut bad = LimitRules::new();
        bad.burst_multiplier = 0.5;

        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.version(), 1);
    }

    #[test]
    fn test_new_rejects_invalid_rules() {
        let mut bad = LimitRules::new();
        bad.set_limit(&LimitTarget::Global, TimeWindow::Second, 10, Some(0.9));
        assert!(ConfigHandle::new(bad).is_err());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let handle = Arc::new(ConfigHandle::new(LimitRules::new()).unwrap());

        let threads: Vec<_> = (0..8u64)
            .map(|i| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    handle
                        .update_limit(
                            &LimitTarget::Endpoint(format!("/api/{}", i)),
                            TimeWindow::Second,
                            i + 1,
                            None,
                        )
                        .unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.version, 9);
        assert_eq!(snapshot.rules.endpoints.len(), 8);
    }
}
