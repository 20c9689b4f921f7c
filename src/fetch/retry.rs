//! Per-source timeout and retry policy, and the fetcher decorator that
//! applies it.
//!
//! Retry rules:
//! - `Timeout` / `Upstream`: retried up to `max_retries` times with
//!   exponential delay.
//! - `Malformed`: returned immediately, another attempt would parse the
//!   same garbage.
//! - `RateLimited`: returned immediately; the scheduler defers the key
//!   instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{FetchResult, Fetcher};
use crate::error::FetchError;
use crate::key::Key;
use crate::snapshot::Snapshot;
use crate::telemetry;

/// Timeout and retry policy for one source.
///
/// ```rust
/// # use agripulse::FetchPolicy;
/// # use std::time::Duration;
/// let policy = FetchPolicy::new()
///     .timeout(Duration::from_secs(8))
///     .max_retries(2);
/// assert_eq!(policy.max_attempts(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Bound on each individual attempt. Default: 10s.
    pub timeout: Duration,
    /// Extra attempts after the first for transient errors. Default: 1.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further one.
    /// Default: 500ms.
    pub retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 1,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl FetchPolicy {
    /// Create a new policy with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of retries after the first attempt.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the delay before the first retry.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }

    /// Upper bound on how long a whole fetch may take under this policy.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.timeout.saturating_mul(self.max_attempts());
        let delays = (0..self.max_retries)
            .map(|r| self.delay_for_retry(r))
            .fold(Duration::ZERO, Duration::saturating_add);
        attempts.saturating_add(delays)
    }
}

/// Run `f` under `policy`: each attempt is bounded by the policy timeout,
/// transient failures are retried.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &FetchPolicy,
    name: &str,
    source: &'static str,
    f: F,
) -> FetchResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FetchResult<T>>,
{
    let mut retry = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(policy.timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for_retry(retry);
                metrics::counter!(telemetry::FETCH_RETRIES_TOTAL, "source" => source)
                    .increment(1);
                warn!(
                    fetcher = name,
                    source,
                    attempt = retry + 1,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient fetch error"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decorator that bounds a [`Fetcher`] by a [`FetchPolicy`].
pub struct RetryingFetcher {
    inner: Arc<dyn Fetcher>,
    policy: FetchPolicy,
}

impl RetryingFetcher {
    /// Wrap a fetcher with timeout and retry logic.
    pub fn new(inner: Arc<dyn Fetcher>, policy: FetchPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }
}

#[async_trait]
impl Fetcher for RetryingFetcher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, key: &Key) -> FetchResult<Snapshot> {
        with_retry(&self.policy, self.inner.name(), key.source().as_str(), || {
            self.inner.fetch(key)
        })
        .await
    }
}
