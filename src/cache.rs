//! Read-through facade over the store and the refresh scheduler.
//!
//! [`SnapshotCache`] is what request handlers talk to. Reads never block on
//! upstream I/O once a key has a snapshot: a stale snapshot is returned
//! immediately and a background refresh is scheduled
//! (stale-while-revalidate). Only a cold key, one that has never been
//! fetched successfully, makes the caller wait, bounded by a deadline.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use agripulse::{CacheConfig, FetchPolicy, Key, SnapshotCache, Source, WeatherApiFetcher};
//! # async fn example() -> agripulse::Result<()> {
//! let weather = WeatherApiFetcher::new("api-key", Duration::from_secs(300))?;
//! let cache = SnapshotCache::builder()
//!     .config(CacheConfig::new().workers(8))
//!     .fetcher(Source::Weather, Arc::new(weather), FetchPolicy::new())
//!     .build()?;
//!
//! let snapshot = cache.get(&Key::weather("indore")?).await?;
//! println!("{}", snapshot.payload());
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::error::{CacheError, Result};
use crate::fetch::{FetchPolicy, Fetcher, FetcherRegistry};
use crate::key::{Key, Source};
use crate::scheduler::{Dispatch, RefreshScheduler};
use crate::snapshot::Snapshot;
use crate::store::{EntryStatus, SnapshotStore};
use crate::telemetry;

/// Tuning for the cache and its refresh machinery.
///
/// ```rust
/// # use agripulse::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .workers(8)
///     .tick_interval(Duration::from_secs(1))
///     .request_deadline(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How often the scheduler scans for due keys. Default: 5s.
    pub tick_interval: Duration,
    /// Concurrent upstream fetches. Default: 4.
    pub workers: usize,
    /// Refreshes that may wait for a worker before dispatches are dropped.
    /// Default: 64.
    pub queue_depth: usize,
    /// How long a cold read waits for the first snapshot. Default: 2s.
    pub request_deadline: Duration,
    /// Fraction of the TTL after which a refresh comes due. Default: 1.0.
    pub refresh_ratio: f64,
    /// Remove entries not read for this long. Default: never.
    pub idle_evict_after: Option<Duration>,
    /// Upper bound on waiting for in-flight refreshes at shutdown.
    /// Default: 10s.
    pub drain_timeout: Duration,
    /// Delay schedule after failed refreshes.
    pub backoff: BackoffConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            workers: 4,
            queue_depth: 64,
            request_deadline: Duration::from_secs(2),
            refresh_ratio: 1.0,
            idle_evict_after: None,
            drain_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    pub fn request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    /// Refresh eagerly at `ttl * ratio` instead of at expiry.
    pub fn refresh_ratio(mut self, ratio: f64) -> Self {
        self.refresh_ratio = ratio;
        self
    }

    pub fn idle_evict_after(mut self, idle: Duration) -> Self {
        self.idle_evict_after = Some(idle);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CacheError::Configuration("workers must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(CacheError::Configuration(
                "queue_depth must be at least 1".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(CacheError::Configuration(
                "tick_interval must be positive".into(),
            ));
        }
        if !(self.refresh_ratio > 0.0 && self.refresh_ratio <= 1.0) {
            return Err(CacheError::Configuration(format!(
                "refresh_ratio must be in (0, 1], got {}",
                self.refresh_ratio
            )));
        }
        Ok(())
    }
}

/// Builder for [`SnapshotCache`].
#[derive(Default)]
pub struct SnapshotCacheBuilder {
    config: CacheConfig,
    fetchers: FetcherRegistry,
}

impl SnapshotCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the fetcher for `source`, bounded by `policy`.
    pub fn fetcher(mut self, source: Source, fetcher: Arc<dyn Fetcher>, policy: FetchPolicy) -> Self {
        self.fetchers.insert(source, fetcher, policy);
        self
    }

    /// Use a prepared registry, replacing fetchers registered so far.
    pub fn fetchers(mut self, fetchers: FetcherRegistry) -> Self {
        self.fetchers = fetchers;
        self
    }

    /// Build the cache and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<SnapshotCache> {
        self.config.validate()?;
        if self.fetchers.is_empty() {
            return Err(CacheError::Configuration("no fetchers registered".into()));
        }

        let store = Arc::new(SnapshotStore::with_refresh_ratio(self.config.refresh_ratio));
        let sources: Vec<&str> = self.fetchers.sources().iter().map(|s| s.as_str()).collect();
        info!(sources = ?sources, "snapshot cache starting");
        let scheduler = RefreshScheduler::spawn(store.clone(), self.fetchers, &self.config);

        Ok(SnapshotCache {
            store,
            scheduler,
            request_deadline: self.config.request_deadline,
        })
    }
}

/// Snapshot cache with stale-while-revalidate reads and background refresh.
pub struct SnapshotCache {
    store: Arc<SnapshotStore>,
    scheduler: RefreshScheduler,
    request_deadline: Duration,
}

impl SnapshotCache {
    pub fn builder() -> SnapshotCacheBuilder {
        SnapshotCacheBuilder::new()
    }

    /// Read `key`, waiting up to the configured request deadline when the
    /// key is cold.
    pub async fn get(&self, key: &Key) -> Result<Snapshot> {
        self.get_within(key, self.request_deadline).await
    }

    /// Read `key`, waiting up to `deadline` when the key is cold.
    ///
    /// With a snapshot present this returns immediately, fresh or stale,
    /// and schedules a refresh when one is due. Without one it dispatches
    /// the first fetch and waits for its commit; a deadline miss yields
    /// [`CacheError::NotYetAvailable`] while the fetch keeps running.
    pub async fn get_within(&self, key: &Key, deadline: Duration) -> Result<Snapshot> {
        let lookup = self.store.read(key);
        if let Some(snapshot) = lookup.snapshot {
            if lookup.due && !lookup.refreshing {
                self.revalidate(key);
            }
            record_read(key, if lookup.stale { "stale" } else { "fresh" });
            return Ok(snapshot);
        }

        if !self.scheduler.serves(key.source()) {
            return Err(CacheError::NoFetcher(key.source()));
        }
        if self.scheduler.is_shutting_down() {
            return Err(CacheError::ShuttingDown);
        }

        let wait_until = Instant::now() + deadline;
        // Subscribe before re-reading so a commit landing in between wakes us.
        let mut commits = self.store.subscribe(key);
        loop {
            let lookup = self.store.read(key);
            if let Some(snapshot) = lookup.snapshot {
                record_read(key, "cold");
                return Ok(snapshot);
            }
            if lookup.due && !lookup.refreshing {
                self.scheduler.ensure_fresh(key)?;
            }

            tokio::select! {
                changed = commits.changed() => {
                    if changed.is_err() {
                        // Entry evicted while we waited.
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wait_until) => break,
            }
        }

        record_read(key, "unavailable");
        debug!(key = %key, deadline_ms = deadline.as_millis() as u64, "cold read timed out");
        Err(CacheError::NotYetAvailable { key: key.to_string() })
    }

    /// Parse `raw` and [`get`](Self::get) it.
    pub async fn get_str(&self, raw: &str) -> Result<Snapshot> {
        let key = Key::parse(raw)?;
        self.get(&key).await
    }

    /// Non-blocking read: the current snapshot if any.
    ///
    /// Schedules a refresh when one is due, including for keys never seen.
    pub fn try_get(&self, key: &Key) -> Option<Snapshot> {
        let lookup = self.store.read(key);
        if lookup.due && !lookup.refreshing {
            self.revalidate(key);
        }
        match &lookup.snapshot {
            Some(_) => record_read(key, if lookup.stale { "stale" } else { "fresh" }),
            None => record_read(key, "unavailable"),
        }
        lookup.snapshot
    }

    /// Start tracking `keys` and dispatch refreshes for those that are due.
    ///
    /// Returns the number of refreshes started. Keys without a registered
    /// fetcher are skipped with a warning and not tracked.
    pub fn warm<I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = Key>,
    {
        let mut started = 0;
        for key in keys {
            if !self.scheduler.serves(key.source()) {
                warn!(key = %key, "cannot warm key without a fetcher for its source");
                continue;
            }
            self.store.track(&key);
            let lookup = self.store.read(&key);
            if !lookup.due || lookup.refreshing {
                continue;
            }
            match self.scheduler.ensure_fresh(&key) {
                Ok(Dispatch::Started) => started += 1,
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "cannot warm key"),
            }
        }
        info!(started, "warmed cache");
        started
    }

    /// Force the next read of `key` to schedule a refresh. The current
    /// snapshot stays readable. Returns false when the key is not tracked.
    pub fn invalidate(&self, key: &Key) -> bool {
        self.store.invalidate(key)
    }

    pub fn status(&self, key: &Key) -> Option<EntryStatus> {
        self.store.status(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Refreshes currently executing.
    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight()
    }

    /// Stop background refresh and drain in-flight fetches. Snapshots
    /// already cached stay readable.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    fn revalidate(&self, key: &Key) {
        match self.scheduler.ensure_fresh(key) {
            Ok(dispatch) => debug!(key = %key, ?dispatch, "revalidating"),
            Err(e) => debug!(key = %key, error = %e, "revalidation not scheduled"),
        }
    }
}

fn record_read(key: &Key, outcome: &'static str) {
    metrics::counter!(telemetry::READS_TOTAL,
        "source" => key.source().as_str(),
        "outcome" => outcome,
    )
    .increment(1);
}
