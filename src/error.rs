//! Agripulse error types

use std::time::Duration;

use crate::key::Source;

/// Failure reported by a fetcher adapter.
///
/// Never surfaced to readers of the cache: the refresh scheduler absorbs
/// these, logs them and turns them into backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether another attempt within the same refresh may succeed.
    ///
    /// `RateLimited` is not transient: the scheduler
    /// defers the key instead of hammering the upstream again.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Upstream(_))
    }

    /// Upstream-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Upstream(_) => "upstream",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Malformed(_) => "malformed",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Upstream(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Malformed(err.to_string())
    }
}

/// Errors visible to callers of the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Cold key: no snapshot was committed before the caller's deadline.
    #[error("no snapshot available yet for {key}")]
    NotYetAvailable { key: String },

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("no fetcher registered for source {0}")]
    NoFetcher(Source),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cache is shutting down")]
    ShuttingDown,
}

/// Result type alias for Agripulse operations
pub type Result<T> = std::result::Result<T, CacheError>;
