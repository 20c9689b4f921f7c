//! Refresh scheduler: decides when keys refresh and drives
//! fetch-then-commit without ever running two fetches for one key.
//!
//! # Tasks
//!
//! [`RefreshScheduler::spawn`] starts two background tasks:
//!
//! - **dispatcher**: pulls keys off a bounded job queue, waits for a worker
//!   permit (the pool size caps concurrent upstream calls) and runs each
//!   fetch in its own task.
//! - **driver**: the single writer. It applies worker outcomes to the
//!   store (`commit` / `fail`) and runs the periodic tick that re-dispatches
//!   due keys and sweeps idle entries.
//!
//! Workers never touch the store themselves; they report over a channel.
//! A drop guard in each worker reports `Abandoned` if the fetch never
//! finishes (panic, abort at shutdown), so a key cannot stay `Refreshing`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::cache::CacheConfig;
use crate::error::{CacheError, FetchError, Result};
use crate::fetch::FetcherRegistry;
use crate::key::{Key, Source};
use crate::snapshot::Snapshot;
use crate::store::{CommitOutcome, SnapshotStore};
use crate::telemetry;

/// What [`RefreshScheduler::ensure_fresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A refresh was queued for a worker.
    Started,
    /// A refresh for this key is already in flight; nothing was queued.
    AlreadyInFlight,
    /// The job queue was full; the key went back to Idle and stays due.
    Dropped,
}

/// Result of one worker run, delivered to the driver.
#[derive(Debug)]
enum Outcome {
    Completed {
        key: Key,
        result: std::result::Result<Snapshot, FetchError>,
    },
    Abandoned {
        key: Key,
    },
}

/// State shared by the handle and both background tasks.
struct Shared {
    store: Arc<SnapshotStore>,
    fetchers: FetcherRegistry,
    backoff: BackoffConfig,
    idle_evict_after: Option<Duration>,
    jobs: mpsc::Sender<Key>,
    shutdown: watch::Receiver<bool>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn ensure_fresh(&self, key: &Key) -> Result<Dispatch> {
        if self.fetchers.get(key.source()).is_none() {
            return Err(CacheError::NoFetcher(key.source()));
        }
        if *self.shutdown.borrow() {
            return Err(CacheError::ShuttingDown);
        }
        if !self.store.try_begin_refresh(key) {
            return Ok(Dispatch::AlreadyInFlight);
        }

        match self.jobs.try_send(key.clone()) {
            Ok(()) => {
                debug!(key = %key, "refresh dispatched");
                Ok(Dispatch::Started)
            }
            Err(TrySendError::Full(key)) => {
                self.store.release(&key);
                metrics::counter!(telemetry::DISPATCHES_DROPPED_TOTAL,
                    "source" => key.source().as_str(),
                )
                .increment(1);
                warn!(key = %key, "refresh queue full, dispatch dropped");
                Ok(Dispatch::Dropped)
            }
            Err(TrySendError::Closed(key)) => {
                self.store.release(&key);
                Err(CacheError::ShuttingDown)
            }
        }
    }

    fn apply(&self, outcome: Outcome) {
        match outcome {
            Outcome::Completed {
                key,
                result: Ok(snapshot),
            } => {
                let status = match self.store.commit(&key, snapshot, &self.backoff) {
                    CommitOutcome::Applied => {
                        debug!(key = %key, "snapshot committed");
                        "ok"
                    }
                    CommitOutcome::Discarded => "discarded",
                };
                metrics::counter!(telemetry::REFRESHES_TOTAL,
                    "source" => key.source().as_str(),
                    "status" => status,
                )
                .increment(1);
            }
            Outcome::Completed {
                key,
                result: Err(error),
            } => {
                let kind = error.kind();
                let message = error.to_string();
                let retry_in = self.store.fail(&key, error, &self.backoff);
                metrics::counter!(telemetry::REFRESHES_TOTAL,
                    "source" => key.source().as_str(),
                    "status" => kind,
                )
                .increment(1);
                warn!(
                    key = %key,
                    error = %message,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "refresh failed, backing off"
                );
            }
            Outcome::Abandoned { key } => {
                let retry_in = self.store.fail(
                    &key,
                    FetchError::Upstream("refresh abandoned".to_string()),
                    &self.backoff,
                );
                metrics::counter!(telemetry::REFRESHES_TOTAL,
                    "source" => key.source().as_str(),
                    "status" => "abandoned",
                )
                .increment(1);
                warn!(
                    key = %key,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "refresh abandoned"
                );
            }
        }
    }

    fn tick(&self) {
        let now = Instant::now();
        if let Some(idle_for) = self.idle_evict_after {
            let evicted = self.store.sweep_idle(idle_for, now);
            if evicted > 0 {
                info!(evicted, "swept idle entries");
            }
        }
        for key in self.store.due_keys(now) {
            match self.ensure_fresh(&key) {
                Ok(_) => {}
                Err(CacheError::NoFetcher(source)) => {
                    debug!(key = %key, %source, "no fetcher for due key");
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "tick dispatch skipped");
                    break;
                }
            }
        }
    }

    fn worker_started(&self) {
        let n = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(telemetry::REFRESHES_IN_FLIGHT).set(n as f64);
    }

    fn worker_finished(&self) {
        let n = self.in_flight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!(telemetry::REFRESHES_IN_FLIGHT).set(n as f64);
    }
}

/// Reports a worker's outcome exactly once: `Completed` via
/// [`finish`](Self::finish), or `Abandoned` when dropped unfinished.
struct RefreshGuard {
    key: Option<Key>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    shared: Arc<Shared>,
}

impl RefreshGuard {
    fn new(key: Key, outcomes: mpsc::UnboundedSender<Outcome>, shared: Arc<Shared>) -> Self {
        shared.worker_started();
        Self {
            key: Some(key),
            outcomes,
            shared,
        }
    }

    fn finish(mut self, result: std::result::Result<Snapshot, FetchError>) {
        if let Some(key) = self.key.take() {
            let _ = self.outcomes.send(Outcome::Completed { key, result });
        }
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.outcomes.send(Outcome::Abandoned { key });
        }
        self.shared.worker_finished();
    }
}

async fn run_refresh(
    shared: Arc<Shared>,
    key: Key,
    outcomes: mpsc::UnboundedSender<Outcome>,
    _permit: OwnedSemaphorePermit,
) {
    let guard = RefreshGuard::new(key.clone(), outcomes, shared.clone());
    let Some(fetcher) = shared.fetchers.get(key.source()) else {
        guard.finish(Err(FetchError::Upstream(format!(
            "no fetcher for {}",
            key.source()
        ))));
        return;
    };

    let started = Instant::now();
    let result = fetcher.fetch(&key).await;
    metrics::histogram!(telemetry::FETCH_DURATION_SECONDS,
        "source" => key.source().as_str(),
    )
    .record(started.elapsed().as_secs_f64());
    guard.finish(result);
}

async fn dispatcher(
    shared: Arc<Shared>,
    mut jobs: mpsc::Receiver<Key>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    workers: usize,
    drain_timeout: Duration,
) {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut running = JoinSet::new();
    let mut shutdown = shared.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = running.join_next(), if !running.is_empty() => {}
            job = jobs.recv() => {
                let Some(key) = job else { break };
                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => permit,
                    _ = shutdown.changed() => {
                        shared.store.release(&key);
                        break;
                    }
                };
                let Ok(permit) = permit else {
                    shared.store.release(&key);
                    break;
                };
                running.spawn(run_refresh(shared.clone(), key, outcomes.clone(), permit));
            }
        }
    }

    // Keys still queued were never fetched.
    jobs.close();
    while let Ok(key) = jobs.try_recv() {
        shared.store.release(&key);
    }

    let drained = tokio::time::timeout(drain_timeout, async {
        while running.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = running.len(),
            "drain timeout elapsed, aborting in-flight refreshes"
        );
        running.shutdown().await;
    }
    debug!("refresh dispatcher stopped");
}

async fn driver(
    shared: Arc<Shared>,
    mut outcomes: mpsc::UnboundedReceiver<Outcome>,
    tick_interval: Duration,
) {
    let mut shutdown = shared.shutdown.clone();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticking = true;

    loop {
        tokio::select! {
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => shared.apply(outcome),
                // Dispatcher and every worker are gone.
                None => break,
            },
            _ = ticker.tick(), if ticking => shared.tick(),
            _ = shutdown.changed(), if ticking => ticking = false,
        }
    }
    debug!("refresh driver stopped");
}

/// Handle to the background refresh machinery.
///
/// Dropping the handle stops the ticker and dispatcher like
/// [`shutdown`](Self::shutdown), without waiting for them.
pub struct RefreshScheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Start the dispatcher and driver tasks.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn spawn(store: Arc<SnapshotStore>, fetchers: FetcherRegistry, config: &CacheConfig) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_depth.max(1));
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            store,
            fetchers,
            backoff: config.backoff.clone(),
            idle_evict_after: config.idle_evict_after,
            jobs: jobs_tx,
            shutdown: shutdown_rx,
            in_flight: AtomicUsize::new(0),
        });

        let tasks = vec![
            tokio::spawn(dispatcher(
                shared.clone(),
                jobs_rx,
                outcomes_tx,
                config.workers,
                config.drain_timeout,
            )),
            tokio::spawn(driver(shared.clone(), outcomes_rx, config.tick_interval)),
        ];

        info!(
            workers = config.workers,
            queue_depth = config.queue_depth,
            tick_ms = config.tick_interval.as_millis() as u64,
            "refresh scheduler started"
        );

        Self {
            shared,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Make sure a refresh of `key` is in flight.
    ///
    /// Returns immediately: the fetch runs on a worker. Creates the entry
    /// if the key is not tracked yet.
    pub fn ensure_fresh(&self, key: &Key) -> Result<Dispatch> {
        self.shared.ensure_fresh(key)
    }

    /// Whether a fetcher is registered for `source`.
    pub fn serves(&self, source: Source) -> bool {
        self.shared.fetchers.get(source).is_some()
    }

    /// Run one scheduling pass now (normally driven by the ticker).
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Refreshes currently executing on workers.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.shared.store
    }

    /// Stop the ticker, stop accepting dispatches and drain in-flight
    /// refreshes (bounded by the configured drain timeout). Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "refresh task ended abnormally");
            }
        }
        info!("refresh scheduler stopped");
    }
}
