//! Snapshot store: the single owner of per-key cache state.
//!
//! Each key maps to a slot holding an [`Entry`] behind its own mutex. Every
//! transition (`try_begin_refresh`, `commit`, `fail`, `release`,
//! `invalidate`) takes that lock for a handful of field updates and never
//! across an `.await`, so per-key operations are linearizable while reads of
//! other keys proceed in parallel.
//!
//! The slot map itself is a moka cache without capacity or expiry: moka
//! provides the concurrent map, removal is explicit (see
//! [`SnapshotStore::sweep_idle`]).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::backoff::BackoffConfig;
use crate::error::FetchError;
use crate::key::Key;
use crate::snapshot::Snapshot;
use crate::telemetry;

/// Refresh state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Mutable control record for one key.
#[derive(Debug)]
struct Entry {
    current: Option<Snapshot>,
    state: RefreshState,
    next_due: Instant,
    consecutive_failures: u32,
    last_error: Option<FetchError>,
    last_access: Instant,
    /// Set by the idle sweep right before the slot leaves the map; holders
    /// of a stale `Arc<Slot>` must re-resolve.
    evicted: bool,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            current: None,
            state: RefreshState::Idle,
            next_due: now,
            consecutive_failures: 0,
            last_error: None,
            last_access: now,
            evicted: false,
        }
    }
}

struct Slot {
    entry: Mutex<Entry>,
    /// Bumped on every applied commit; cold readers wait on it.
    commits: watch::Sender<u64>,
}

impl Slot {
    fn new(now: Instant) -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            entry: Mutex::new(Entry::new(now)),
            commits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entry> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of [`SnapshotStore::read`].
#[derive(Debug, Clone)]
pub struct Lookup {
    /// Current snapshot, possibly stale.
    pub snapshot: Option<Snapshot>,
    /// `now - fetched_at > ttl`. False when there is no snapshot.
    pub stale: bool,
    /// `next_due <= now`: a refresh should be started. Unlike `stale` this
    /// respects failure backoff and forced invalidation.
    pub due: bool,
    /// A refresh is in flight.
    pub refreshing: bool,
}

impl Lookup {
    fn missing() -> Self {
        Self {
            snapshot: None,
            stale: false,
            due: true,
            refreshing: false,
        }
    }
}

/// Result of [`SnapshotStore::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The snapshot became `current`.
    Applied,
    /// An equal-or-newer snapshot was already current; nothing replaced.
    Discarded,
}

/// Point-in-time view of an entry, for observability.
#[derive(Debug, Clone)]
pub struct EntryStatus {
    pub state: RefreshState,
    pub has_snapshot: bool,
    pub age: Option<Duration>,
    pub stale: bool,
    /// Time until the next scheduled refresh; zero when already due.
    pub next_due_in: Duration,
    pub consecutive_failures: u32,
    pub last_error: Option<FetchError>,
}

/// Concurrent table of the latest snapshot per key plus refresh metadata.
pub struct SnapshotStore {
    slots: moka::sync::Cache<Key, Arc<Slot>>,
    refresh_ratio: f64,
}

impl SnapshotStore {
    /// Create an empty store. Refreshes come due when a snapshot reaches
    /// its full TTL.
    pub fn new() -> Self {
        Self::with_refresh_ratio(1.0)
    }

    /// Create an empty store whose refreshes come due at
    /// `ttl * refresh_ratio`. Ratios outside `(0, 1]` are clamped.
    pub fn with_refresh_ratio(refresh_ratio: f64) -> Self {
        let refresh_ratio = if refresh_ratio.is_finite() {
            refresh_ratio.clamp(0.01, 1.0)
        } else {
            1.0
        };
        Self {
            slots: moka::sync::Cache::builder().build(),
            refresh_ratio,
        }
    }

    /// Return the live slot for `key`, creating the entry when missing.
    fn slot(&self, key: &Key) -> Arc<Slot> {
        loop {
            let slot = self
                .slots
                .get_with_by_ref(key, || Arc::new(Slot::new(Instant::now())));
            if !slot.lock().evicted {
                return slot;
            }
            // Raced with the idle sweep; the map no longer holds this slot.
        }
    }

    /// Return the live slot for `key` without creating one.
    fn existing(&self, key: &Key) -> Option<Arc<Slot>> {
        self.slots.get(key).filter(|slot| !slot.lock().evicted)
    }

    fn next_due_for(&self, snapshot: &Snapshot) -> Instant {
        snapshot.fetched_at() + snapshot.ttl().mul_f64(self.refresh_ratio)
    }

    /// Read the current snapshot and its staleness. Never creates an entry.
    pub fn read(&self, key: &Key) -> Lookup {
        let Some(slot) = self.existing(key) else {
            return Lookup::missing();
        };
        let now = Instant::now();
        let mut entry = slot.lock();
        entry.last_access = now;
        let stale = entry
            .current
            .as_ref()
            .is_some_and(|s| s.is_stale_at(now));
        Lookup {
            snapshot: entry.current.clone(),
            stale,
            due: entry.next_due <= now,
            refreshing: entry.state == RefreshState::Refreshing,
        }
    }

    /// Create the entry for `key` if it does not exist yet.
    pub fn track(&self, key: &Key) {
        let _ = self.slot(key);
    }

    /// Atomically transition Idle → Refreshing. Returns false when a refresh
    /// is already in flight. Creates the entry when missing.
    pub fn try_begin_refresh(&self, key: &Key) -> bool {
        let slot = self.slot(key);
        let mut entry = slot.lock();
        match entry.state {
            RefreshState::Refreshing => false,
            RefreshState::Idle => {
                entry.state = RefreshState::Refreshing;
                true
            }
        }
    }

    /// Install `snapshot` as current unless an equal-or-newer one is
    /// already there, and return the key to Idle.
    ///
    /// A discarded result counts as an unproductive refresh: the failure
    /// count goes up and `next_due` moves out by `backoff`, so an upstream
    /// serving old data is not refetched on every tick.
    pub fn commit(
        &self,
        key: &Key,
        snapshot: Snapshot,
        backoff: &BackoffConfig,
    ) -> CommitOutcome {
        let slot = self.slot(key);
        let (outcome, retry_in) = {
            let mut entry = slot.lock();
            entry.state = RefreshState::Idle;

            let newer = entry
                .current
                .as_ref()
                .is_none_or(|current| snapshot.fetched_at() > current.fetched_at());
            if newer {
                entry.consecutive_failures = 0;
                entry.last_error = None;
                entry.next_due = self.next_due_for(&snapshot);
                entry.current = Some(snapshot);
                (CommitOutcome::Applied, Duration::ZERO)
            } else {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                let delay = backoff.delay_after_failures(entry.consecutive_failures);
                entry.next_due = Instant::now() + delay;
                (CommitOutcome::Discarded, delay)
            }
        };

        match outcome {
            CommitOutcome::Applied => {
                slot.commits.send_modify(|version| *version += 1);
            }
            CommitOutcome::Discarded => {
                debug!(
                    key = %key,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "discarded snapshot not newer than current"
                );
                metrics::counter!(telemetry::COMMITS_DISCARDED_TOTAL,
                    "source" => key.source().as_str(),
                )
                .increment(1);
            }
        }
        outcome
    }

    /// Return the key to Idle after a failed refresh, leaving `current`
    /// untouched, and push `next_due` out by the backoff for the new
    /// failure count. Returns the applied delay.
    pub fn fail(&self, key: &Key, error: FetchError, backoff: &BackoffConfig) -> Duration {
        let slot = self.slot(key);
        let mut entry = slot.lock();
        entry.state = RefreshState::Idle;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let delay = backoff.effective_delay(entry.consecutive_failures, error.retry_after());
        entry.next_due = Instant::now() + delay;
        entry.last_error = Some(error);
        delay
    }

    /// Return the key to Idle without counting a failure. Used when a
    /// dispatch is dropped or abandoned before the fetch ran to completion.
    pub fn release(&self, key: &Key) {
        if let Some(slot) = self.existing(key) {
            slot.lock().state = RefreshState::Idle;
        }
    }

    /// Make the key due immediately. No-op for untracked keys.
    pub fn invalidate(&self, key: &Key) -> bool {
        match self.existing(key) {
            Some(slot) => {
                slot.lock().next_due = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Keys that are Idle and due at `now`.
    pub fn due_keys(&self, now: Instant) -> Vec<Key> {
        self.slots
            .iter()
            .filter_map(|(key, slot)| {
                let entry = slot.lock();
                let due = !entry.evicted
                    && entry.state == RefreshState::Idle
                    && entry.next_due <= now;
                due.then(|| (*key).clone())
            })
            .collect()
    }

    /// Remove Idle entries not read for longer than `idle_for`. Entries with
    /// a refresh in flight are kept. Returns the number removed.
    pub fn sweep_idle(&self, idle_for: Duration, now: Instant) -> usize {
        let mut removed = 0;
        for (key, slot) in self.slots.iter() {
            let mut entry = slot.lock();
            if entry.evicted
                || entry.state == RefreshState::Refreshing
                || now.saturating_duration_since(entry.last_access) <= idle_for
            {
                continue;
            }
            entry.evicted = true;
            self.slots.invalidate(&*key);
            removed += 1;
            debug!(key = %key, "evicted idle entry");
        }
        if removed > 0 {
            metrics::counter!(telemetry::EVICTIONS_TOTAL).increment(removed as u64);
        }
        removed
    }

    /// Subscribe to applied commits for `key`, creating the entry if needed.
    ///
    /// The receiver has already seen the current version, so
    /// `changed().await` resolves on the next applied commit.
    pub fn subscribe(&self, key: &Key) -> watch::Receiver<u64> {
        self.slot(key).commits.subscribe()
    }

    /// Observability view of an entry.
    pub fn status(&self, key: &Key) -> Option<EntryStatus> {
        let slot = self.existing(key)?;
        let now = Instant::now();
        let entry = slot.lock();
        Some(EntryStatus {
            state: entry.state,
            has_snapshot: entry.current.is_some(),
            age: entry.current.as_ref().map(|s| s.age_at(now)),
            stale: entry.current.as_ref().is_some_and(|s| s.is_stale_at(now)),
            next_due_in: entry.next_due.saturating_duration_since(now),
            consecutive_failures: entry.consecutive_failures,
            last_error: entry.last_error.clone(),
        })
    }

    /// When the key is next due, if tracked.
    pub fn next_due(&self, key: &Key) -> Option<Instant> {
        self.existing(key).map(|slot| slot.lock().next_due)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.run_pending_tasks();
        self.slots.entry_count() as usize
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
