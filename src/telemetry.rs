//! Telemetry metric name constants.
//!
//! Centralised metric names for agripulse operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `agripulse_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `source`: upstream source ("weather", "mandi", "commodity")
//! - `outcome`: read outcome: "fresh", "stale", "cold" or "unavailable"
//! - `status`: refresh outcome: "ok", "discarded" or the failure kind
//!   ("timeout", "upstream", "rate_limited", "malformed", "abandoned")

/// Total cache reads.
///
/// Labels: `source`, `outcome`.
pub const READS_TOTAL: &str = "agripulse_reads_total";

/// Total completed refreshes.
///
/// Labels: `source`, `status`.
pub const REFRESHES_TOTAL: &str = "agripulse_refreshes_total";

/// Fetch duration in seconds, including retries.
///
/// Labels: `source`.
pub const FETCH_DURATION_SECONDS: &str = "agripulse_fetch_duration_seconds";

/// Total retry attempts inside a single refresh (not counting the first).
///
/// Labels: `source`.
pub const FETCH_RETRIES_TOTAL: &str = "agripulse_fetch_retries_total";

/// Commits discarded because a newer snapshot was already current.
///
/// Labels: `source`.
pub const COMMITS_DISCARDED_TOTAL: &str = "agripulse_commits_discarded_total";

/// Refresh dispatches dropped because the worker queue was full.
///
/// Labels: `source`.
pub const DISPATCHES_DROPPED_TOTAL: &str = "agripulse_dispatches_dropped_total";

/// Entries removed by the idle sweep.
pub const EVICTIONS_TOTAL: &str = "agripulse_evictions_total";

/// Refreshes currently in flight.
pub const REFRESHES_IN_FLIGHT: &str = "agripulse_refreshes_in_flight";
