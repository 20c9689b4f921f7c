//! Shared test fetchers and helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use agripulse::{
    CacheConfig, FetchError, FetchPolicy, FetchResult, Fetcher, Key, Snapshot, SnapshotCache,
    Source,
};

/// Scripted fetcher: each call sleeps `delay`, then returns the next
/// scripted result, or `{"key": .., "seq": n}` once the script runs out.
pub struct MockFetcher {
    ttl: Duration,
    delay: Duration,
    stamped_at: Option<Instant>,
    script: Mutex<VecDeque<FetchResult<Value>>>,
    calls: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
    started_at: Mutex<Vec<Instant>>,
}

impl MockFetcher {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            delay: Duration::ZERO,
            stamped_at: None,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            started_at: Mutex::new(Vec::new()),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stamp every snapshot with `at` instead of the completion time, like
    /// an upstream that keeps reporting the same observation.
    pub fn stamped_at(mut self, at: Instant) -> Self {
        self.stamped_at = Some(at);
        self
    }

    pub fn then_ok(self, payload: Value) -> Self {
        self.script.lock().unwrap().push_back(Ok(payload));
        self
    }

    pub fn then_err(self, error: FetchError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Instants at which each call started.
    pub fn started_at(&self) -> Vec<Instant> {
        self.started_at.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self, key: &Key) -> FetchResult<Snapshot> {
        let seq = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.started_at.lock().unwrap().push(Instant::now());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        let payload = match scripted {
            Some(result) => result?,
            None => json!({ "key": key.as_str(), "seq": seq }),
        };
        Ok(match self.stamped_at {
            Some(at) => Snapshot::with_fetched_at(payload, at, self.ttl),
            None => Snapshot::new(payload, self.ttl),
        })
    }
}

/// Policy without retries, so call counts match refresh counts.
pub fn single_attempt() -> FetchPolicy {
    FetchPolicy::new()
        .max_retries(0)
        .timeout(Duration::from_secs(3600))
}

/// Build a cache serving weather keys from `fetcher`.
pub fn weather_cache(fetcher: Arc<MockFetcher>, config: CacheConfig) -> SnapshotCache {
    SnapshotCache::builder()
        .config(config)
        .fetcher(Source::Weather, fetcher, single_attempt())
        .build()
        .expect("cache should build")
}

/// Poll `check` every 10ms until it holds, failing after `within`.
pub async fn wait_for(within: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + within;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached within {within:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn weather(location: &str) -> Key {
    Key::weather(location).unwrap()
}
