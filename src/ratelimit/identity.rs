//! Caller identities and roles.
//!
//! Identity and role are resolved by the authentication layer in front of
//! the limiter; this module only gives them a stable shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Prefix marking an anonymous caller identified by address.
const IP_PREFIX: &str = "ip:";

/// Address used when neither a user id nor a client address is known.
const UNKNOWN_ADDRESS: &str = "unknown";

/// The caller a request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Identity {
    /// Authenticated caller, keyed by its user id.
    User(String),
    /// Anonymous caller, keyed by client address.
    Ip(String),
}

impl Identity {
    /// Build an identity from an optional user id and client address.
    ///
    /// A missing or blank user id falls back to the address; a missing
    /// address falls back to `ip:unknown`.
    pub fn resolve(user_id: Option<&str>, addr: Option<IpAddr>) -> Self {
        match user_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Identity::User(id.to_string()),
            None => match addr {
                Some(addr) => Identity::Ip(addr.to_string()),
                None => Identity::Ip(UNKNOWN_ADDRESS.to_string()),
            },
        }
    }

    /// Parse the key form produced by `Display` (`ip:<addr>` or a user id).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.strip_prefix(IP_PREFIX) {
            Some("") => None,
            Some(addr) => Some(Identity::Ip(addr.to_string())),
            None => Some(Identity::User(raw.to_string())),
        }
    }

    /// The bare value: user id or address, without the `ip:` prefix.
    pub fn value(&self) -> &str {
        match self {
            Identity::User(id) => id,
            Identity::Ip(addr) => addr,
        }
    }

    /// Whether this caller is anonymous.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Ip(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => f.write_str(id),
            Identity::Ip(addr) => write!(f, "{}{}", IP_PREFIX, addr),
        }
    }
}

impl TryFrom<String> for Identity {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Identity::parse(&raw).ok_or_else(|| format!("invalid identity '{}'", raw))
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.to_string()
    }
}

/// Caller role, as resolved by the identity system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
    Anonymous,
    /// Any deployment-specific role name.
    Custom(String),
}

impl Role {
    /// Role used when the caller's role could not be resolved.
    pub fn resolve(raw: Option<&str>) -> Self {
        raw.map(Role::from).unwrap_or(Role::Anonymous)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Anonymous => "anonymous",
            Role::Custom(name) => name,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Role {
    fn from(raw: &str) -> Self {
        let name = raw.trim().to_ascii_lowercase();
        match name.as_str() {
            "admin" => Role::Admin,
            "operator" => Role::Operator,
            "viewer" => Role::Viewer,
            "" | "anonymous" => Role::Anonymous,
            _ => Role::Custom(name),
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        Role::from(raw.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}
