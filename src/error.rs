//! Error types for the Tollbooth service.

use thiserror::Error;

/// Main error type for Tollbooth operations.
///
/// Rate limit denials are not errors; they are reported through
/// [`RateLimitResult`](crate::ratelimit::RateLimitResult).
#[derive(Error, Debug)]
pub enum TollboothError {
    /// Service configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit definition was rejected; the previous snapshot stays active
    #[error("Invalid limit configuration: {0}")]
    ConfigurationInvalid(String),

    /// The shared counter store could not execute an operation
    #[error("Counter store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// The shared counter store did not answer within the time budget
    #[error("Counter store timed out during {operation} after {elapsed_ms}ms")]
    StoreTimeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollboothError {
    /// Whether this error stems from the counter store (and is therefore
    /// subject to the fail-open / fail-closed policy).
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            TollboothError::StoreUnavailable { .. } | TollboothError::StoreTimeout { .. }
        )
    }
}

impl From<config::ConfigError> for TollboothError {
    fn from(err: config::ConfigError) -> Self {
        TollboothError::Config(err.to_string())
    }
}

/// Result type alias for Tollbooth operations.
pub type Result<T> = std::result::Result<T, TollboothError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_are_classified() {
        let unavailable = TollboothError::StoreUnavailable {
            operation: "consume",
            reason: "connection refused".to_string(),
        };
        let timeout = TollboothError::StoreTimeout {
            operation: "consume",
            elapsed_ms: 25,
        };
        let invalid = TollboothError::ConfigurationInvalid("limit must be > 0".to_string());

        assert!(unavailable.is_store_failure());
        assert!(timeout.is_store_failure());
        assert!(!invalid.is_store_failure());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = TollboothError::StoreTimeout {
            operation: "scan",
            elapsed_ms: 40,
        };
        assert_eq!(
            err.to_string(),
            "Counter store timed out during scan after 40ms"
        );

        let err = TollboothError::StoreUnavailable {
            operation: "consume",
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Counter store unavailable during consume: connection refused"
        );
    }
}
