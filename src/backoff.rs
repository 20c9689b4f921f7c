//! Exponential backoff for failing keys.
//!
//! After a failed refresh the scheduler pushes the key's `next_due` out by
//! `base * 2^(failures - 1)`, capped at `max`, so a failing upstream is not
//! hammered on every tick.

use std::time::Duration;

/// Configuration for refresh backoff after consecutive failures.
///
/// ```rust
/// # use agripulse::BackoffConfig;
/// # use std::time::Duration;
/// let config = BackoffConfig::new()
///     .base(Duration::from_secs(1))
///     .max(Duration::from_secs(4));
/// assert_eq!(config.delay_after_failures(3), Duration::from_secs(4));
/// assert_eq!(config.delay_after_failures(10), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure. Default: 1s.
    pub base: Duration,
    /// Upper bound on the delay. Default: 60s.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay after the first failure.
    pub fn base(mut self, delay: Duration) -> Self {
        self.base = delay;
        self
    }

    /// Set the maximum delay.
    pub fn max(mut self, delay: Duration) -> Self {
        self.max = delay;
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `failures == 0` yields zero. Non-decreasing in `failures` and never
    /// above `max`.
    pub fn delay_after_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Delay honouring an upstream `retry_after` hint: the larger of the
    /// hint and the computed backoff, still capped at `max`.
    pub fn effective_delay(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_after_failures(failures);
        match retry_after {
            Some(hint) => hint.max(computed).min(self.max),
            None => computed,
        }
    }
}
