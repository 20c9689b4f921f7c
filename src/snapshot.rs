//! Immutable fetched payloads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// A fetched payload plus the time it was fetched and how long it stays
/// fresh.
///
/// Snapshots are never mutated. The store shares them behind an `Arc` and
/// replaces them wholesale on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    payload: Arc<Value>,
    fetched_at: Instant,
    ttl: Duration,
}

impl Snapshot {
    /// Create a snapshot stamped with the current time.
    pub fn new(payload: Value, ttl: Duration) -> Self {
        Self::with_fetched_at(payload, Instant::now(), ttl)
    }

    /// Create a snapshot with an explicit fetch time.
    pub fn with_fetched_at(payload: Value, fetched_at: Instant, ttl: Duration) -> Self {
        Self {
            payload: Arc::new(payload),
            fetched_at,
            ttl,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Age of the snapshot at `now` (zero if `now` precedes the fetch).
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }

    /// Stale once the age strictly exceeds the TTL.
    pub fn is_stale_at(&self, now: Instant) -> bool {
        self.age_at(now) > self.ttl
    }
}
