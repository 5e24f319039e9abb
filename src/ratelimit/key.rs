//! Scope keys identifying one token bucket in the counter store.

use std::fmt;

use super::identity::Identity;
use super::window::TimeWindow;

/// Subject token used for the limit shared by every caller.
const EVERYONE: &str = "*";
/// Namespace for authenticated callers' buckets.
const USER_NS: &str = "u:";
/// Namespace for anonymous callers' buckets.
const IP_NS: &str = "ip:";
/// Scope token for limits that apply across all endpoints.
const ALL_ENDPOINTS: &str = "global";
/// Delimiter between key components.
const SEP: char = '|';

/// Whose tokens a bucket holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    /// A single caller.
    Identity(Identity),
    /// The whole population (the global limit).
    Everyone,
}

impl Subject {
    fn parse(raw: &str) -> Option<Self> {
        if raw == EVERYONE {
            return Some(Subject::Everyone);
        }
        if let Some(id) = raw.strip_prefix(USER_NS) {
            return (!id.is_empty()).then(|| Subject::Identity(Identity::User(id.to_string())));
        }
        raw.strip_prefix(IP_NS)
            .filter(|addr| !addr.is_empty())
            .map(|addr| Subject::Identity(Identity::Ip(addr.to_string())))
    }

    /// The identity, if this subject is a single caller.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Subject::Identity(identity) => Some(identity),
            Subject::Everyone => None,
        }
    }
}

/// Key form: every subject lives in its own namespace, so no user id can
/// name an address bucket or the global bucket.
impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Identity(Identity::User(id)) => write!(f, "{}{}", USER_NS, id),
            Subject::Identity(Identity::Ip(addr)) => write!(f, "{}{}", IP_NS, addr),
            Subject::Everyone => f.write_str(EVERYONE),
        }
    }
}

/// Which requests a bucket counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every endpoint.
    All,
    /// A single endpoint, by path.
    Endpoint(String),
}

impl Scope {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "" => None,
            ALL_ENDPOINTS => Some(Scope::All),
            path => Some(Scope::Endpoint(path.to_string())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str(ALL_ENDPOINTS),
            Scope::Endpoint(path) => f.write_str(path),
        }
    }
}

/// A key that uniquely identifies one bucket: subject, scope and window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub subject: Subject,
    pub scope: Scope,
    pub window: TimeWindow,
}

impl ScopeKey {
    /// Bucket for one caller's role limit.
    pub fn identity(identity: &Identity, window: TimeWindow) -> Self {
        Self {
            subject: Subject::Identity(identity.clone()),
            scope: Scope::All,
            window,
        }
    }

    /// Bucket for one caller on one endpoint.
    pub fn endpoint(identity: &Identity, endpoint: &str, window: TimeWindow) -> Self {
        Self {
            subject: Subject::Identity(identity.clone()),
            scope: Scope::Endpoint(endpoint.to_string()),
            window,
        }
    }

    /// Bucket shared by all callers.
    pub fn global(window: TimeWindow) -> Self {
        Self {
            subject: Subject::Everyone,
            scope: Scope::All,
            window,
        }
    }

    /// Convert to a store key.
    /// Format: "{prefix}{subject}|{scope}|{window}"
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}{}{}{}{}{}",
            prefix, self.subject, SEP, self.scope, SEP, self.window
        )
    }

    /// Parse from a store key.
    ///
    /// Components are split from the right, so a subject containing the
    /// delimiter still round-trips.
    pub fn from_store_key(key: &str, prefix: &str) -> Option<Self> {
        let rest = key.strip_prefix(prefix)?;
        let (rest, window) = rest.rsplit_once(SEP)?;
        let (subject, scope) = rest.rsplit_once(SEP)?;

        Some(Self {
            subject: Subject::parse(subject)?,
            scope: Scope::parse(scope)?,
            window: window.parse().ok()?,
        })
    }

    /// Key prefix under which every bucket of `subject` lives.
    ///
    /// Prefix matches are a superset (an id `a` also prefixes `a|b`), so
    /// callers filter parsed keys by exact subject.
    pub fn subject_prefix(prefix: &str, subject: &Subject) -> String {
        format!("{}{}{}", prefix, subject, SEP)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}{}{}", self.subject, SEP, self.scope, SEP, self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_store_format() {
        let user = Identity::User("user-123".to_string());
        let key = ScopeKey::identity(&user, TimeWindow::Minute);
        assert_eq!(key.to_store_key("rl:"), "rl:u:user-123|global|minute");

        let anon = Identity::Ip("10.1.2.3".to_string());
        let key = ScopeKey::endpoint(&anon, "/api/search", TimeWindow::Second);
        assert_eq!(key.to_store_key("rl:"), "rl:ip:10.1.2.3|/api/search|second");

        let key = ScopeKey::global(TimeWindow::Hour);
        assert_eq!(key.to_store_key("rl:"), "rl:*|global|hour");
    }

    #[test]
    fn test_scope_key_parsing() {
        let parsed = ScopeKey::from_store_key("rl:ip:10.1.2.3|/api/search|second", "rl:").unwrap();
        assert_eq!(
            parsed.subject,
            Subject::Identity(Identity::Ip("10.1.2.3".to_string()))
        );
        assert_eq!(parsed.scope, Scope::Endpoint("/api/search".to_string()));
        assert_eq!(parsed.window, TimeWindow::Second);

        let parsed = ScopeKey::from_store_key("rl:*|global|day", "rl:").unwrap();
        assert_eq!(parsed, ScopeKey::global(TimeWindow::Day));
    }

    #[test]
    fn test_scope_key_subject_with_delimiter() {
        let odd = Identity::User("team|ops".to_string());
        let key = ScopeKey::identity(&odd, TimeWindow::Minute);
        let parsed = ScopeKey::from_store_key(&key.to_store_key("rl:"), "rl:").unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_scope_key_parsing_invalid() {
        assert!(ScopeKey::from_store_key("invalid", "rl:").is_none());
        assert!(ScopeKey::from_store_key("rl:only|two", "rl:").is_none());
        assert!(ScopeKey::from_store_key("rl:u:a|global|fortnight", "rl:").is_none());
        assert!(ScopeKey::from_store_key("other:u:a|global|minute", "rl:").is_none());
        assert!(ScopeKey::from_store_key("rl:a|global|minute", "rl:").is_none());
        assert!(ScopeKey::from_store_key("rl:u:|global|minute", "rl:").is_none());
    }

    #[test]
    fn test_user_ids_cannot_alias_other_subjects() {
        let global = ScopeKey::global(TimeWindow::Minute).to_store_key("rl:");
        let star = ScopeKey::identity(&Identity::User("*".to_string()), TimeWindow::Minute);
        assert_eq!(star.to_store_key("rl:"), "rl:u:*|global|minute");
        assert_ne!(star.to_store_key("rl:"), global);

        let spoofed = Identity::User("ip:1.2.3.4".to_string());
        let anon = Identity::Ip("1.2.3.4".to_string());
        let spoofed_key = ScopeKey::identity(&spoofed, TimeWindow::Minute).to_store_key("rl:");
        let anon_key = ScopeKey::identity(&anon, TimeWindow::Minute).to_store_key("rl:");
        assert_ne!(spoofed_key, anon_key);

        let parsed = ScopeKey::from_store_key(&spoofed_key, "rl:").unwrap();
        assert_eq!(parsed.subject, Subject::Identity(spoofed));
        let parsed = ScopeKey::from_store_key(&star.to_store_key("rl:"), "rl:").unwrap();
        assert_eq!(parsed, star);
    }
}
