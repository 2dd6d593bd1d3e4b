// ⚠️ Typed errors for the upstream boundary and configuration
//
// Storage and orchestration code stays on anyhow::Result; these two enums exist
// where callers must branch on the failure kind (retry on 429, disable an
// adapter on a bad setting).

use thiserror::Error;

// ============================================================================
// FETCH ERRORS
// ============================================================================

/// Failure of a single upstream call
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("request rejected: HTTP {0}")]
    Status(u16),

    #[error("malformed payload: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited)
    }

    /// Errors that say nothing about the request itself, only about the
    /// service being unreachable right now.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout | FetchError::RateLimited | FetchError::Server(_)
        )
    }

    /// Map a non-success HTTP status to its error kind
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FetchError::RateLimited,
            500..=599 => FetchError::Server(status),
            other => FetchError::Status(other),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        ConfigError::Invalid {
            key,
            value: value.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(FetchError::from_status(429).is_rate_limited());
        assert!(matches!(FetchError::from_status(503), FetchError::Server(503)));
        assert!(matches!(FetchError::from_status(404), FetchError::Status(404)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Server(502).is_transient());
        assert!(FetchError::Network("reset".to_string()).is_transient());
        assert!(!FetchError::Status(401).is_transient());
        assert!(!FetchError::Decode("eof".to_string()).is_transient());
    }
}
