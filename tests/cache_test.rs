//! End-to-end behaviour of `SnapshotCache` on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::time::Instant;

use agripulse::{
    BackoffConfig, CacheConfig, CacheError, FetchError, Key, RefreshState, SnapshotCache, Source,
};
use common::{MockFetcher, single_attempt, wait_for, weather, weather_cache};

const TTL: Duration = Duration::from_secs(300);

/// Ticker far enough out that only reads trigger refreshes.
fn quiet() -> CacheConfig {
    CacheConfig::new().tick_interval(Duration::from_secs(3600))
}

#[tokio::test(start_paused = true)]
async fn serves_stale_snapshot_while_refreshing() {
    let fetcher = Arc::new(
        MockFetcher::new(TTL)
            .delay(Duration::from_secs(1))
            .then_ok(json!({"v": "A"}))
            .then_ok(json!({"v": "B"})),
    );
    let cache = weather_cache(fetcher.clone(), quiet());
    let key = weather("indore");

    // Cold: waits for the first fetch.
    let started = Instant::now();
    let a = cache.get_within(&key, Duration::from_secs(5)).await.unwrap();
    assert_eq!(a.payload()["v"], "A");
    assert_eq!(started.elapsed(), Duration::from_secs(1));

    // Past the TTL: the stale snapshot comes back without waiting.
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(cache.status(&key).unwrap().stale);
    let before = Instant::now();
    let stale = cache.get(&key).await.unwrap();
    assert_eq!(stale.payload()["v"], "A");
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(cache.status(&key).unwrap().state, RefreshState::Refreshing);

    // Once the background refresh lands, readers see B.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let b = cache.get(&key).await.unwrap();
    assert_eq!(b.payload()["v"], "B");
    assert!(b.fetched_at() > a.fetched_at());
    assert_eq!(fetcher.calls(), 2);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cold_key_past_deadline_is_not_yet_available() {
    let fetcher = Arc::new(MockFetcher::new(TTL).delay(Duration::from_secs(5)));
    let cache = weather_cache(fetcher.clone(), quiet());
    let key = weather("bhopal");

    let started = Instant::now();
    let err = cache
        .get_within(&key, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotYetAvailable { ref key } if key == "weather:bhopal"));
    assert_eq!(started.elapsed(), Duration::from_secs(1));

    // The fetch kept running and a second reader does not start another.
    let _ = cache.get_within(&key, Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(cache.try_get(&key).is_some());
    assert_eq!(fetcher.calls(), 1);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_reads_share_one_fetch() {
    let fetcher = Arc::new(MockFetcher::new(TTL).delay(Duration::from_millis(500)));
    let cache = weather_cache(fetcher.clone(), quiet());
    let key = weather("indore");

    let reads = (0..10).map(|_| cache.get(&key));
    let results = join_all(reads).await;

    for result in &results {
        let snapshot = result.as_ref().unwrap();
        assert_eq!(snapshot.payload()["seq"], 1);
    }
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fetcher.max_active(), 1);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cold_key_with_failing_upstream_is_not_yet_available() {
    let mut fetcher = MockFetcher::new(Duration::from_secs(900));
    for _ in 0..5 {
        fetcher = fetcher.then_err(FetchError::RateLimited { retry_after: None });
    }
    let fetcher = Arc::new(fetcher);
    let cache = SnapshotCache::builder()
        .config(CacheConfig::new().tick_interval(Duration::from_secs(1)))
        .fetcher(Source::Mandi, fetcher.clone(), single_attempt())
        .build()
        .unwrap();
    let key = Key::mandi("wheat", "indore").unwrap();

    let started = Instant::now();
    let err = cache
        .get_within(&key, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotYetAvailable { ref key } if key == "mandi:wheat:indore"));
    assert_eq!(started.elapsed(), Duration::from_secs(5));

    // Attempts at 0s, 1s and 3s; the next one is not due until 7s.
    assert_eq!(fetcher.calls(), 3);
    let starts = fetcher.started_at();
    let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    let status = cache.status(&key).unwrap();
    assert!(!status.has_snapshot);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(
        status.last_error,
        Some(FetchError::RateLimited { retry_after: None })
    );

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn try_get_never_waits() {
    let fetcher = Arc::new(MockFetcher::new(TTL).delay(Duration::from_secs(1)));
    let cache = weather_cache(fetcher.clone(), quiet());
    let key = weather("dewas");

    assert!(cache.try_get(&key).is_none());
    assert_eq!(cache.status(&key).unwrap().state, RefreshState::Refreshing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.try_get(&key).is_some());
    assert_eq!(fetcher.calls(), 1);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_previous_snapshot() {
    let fetcher = Arc::new(
        MockFetcher::new(Duration::from_secs(10))
            .then_ok(json!({"v": "A"}))
            .then_err(FetchError::Upstream("HTTP 503".into())),
    );
    let config = CacheConfig::new()
        .tick_interval(Duration::from_secs(1))
        .backoff(BackoffConfig::new().base(Duration::from_secs(60)));
    let cache = weather_cache(fetcher.clone(), config);
    let key = weather("indore");

    cache.get(&key).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    wait_for(Duration::from_secs(5), || fetcher.calls() == 2).await;
    wait_for(Duration::from_secs(5), || {
        cache.status(&key).unwrap().consecutive_failures == 1
    })
    .await;

    let status = cache.status(&key).unwrap();
    assert_eq!(status.state, RefreshState::Idle);
    assert_eq!(
        status.last_error,
        Some(FetchError::Upstream("HTTP 503".into()))
    );
    let snapshot = cache.get(&key).await.unwrap();
    assert_eq!(snapshot.payload()["v"], "A");

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_key_backs_off_exponentially() {
    let fetcher = Arc::new(
        MockFetcher::new(TTL)
            .then_err(FetchError::RateLimited { retry_after: None })
            .then_err(FetchError::RateLimited { retry_after: None })
            .then_err(FetchError::RateLimited { retry_after: None }),
    );
    let config = CacheConfig::new()
        .tick_interval(Duration::from_millis(100))
        .backoff(BackoffConfig::new().base(Duration::from_secs(1)));
    let cache = weather_cache(fetcher.clone(), config);
    let key = weather("indore");

    assert_eq!(cache.warm([key.clone()]), 1);
    wait_for(Duration::from_secs(30), || fetcher.calls() == 4).await;
    wait_for(Duration::from_secs(1), || {
        cache.status(&key).is_some_and(|s| s.has_snapshot)
    })
    .await;

    let starts = fetcher.started_at();
    let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([1, 2, 4]) {
        let expected = Duration::from_secs(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(200),
            "gap {gap:?}, expected about {expected:?}"
        );
    }
    assert_eq!(cache.status(&key).unwrap().consecutive_failures, 0);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_extends_backoff() {
    let fetcher = Arc::new(MockFetcher::new(TTL).then_err(FetchError::RateLimited {
        retry_after: Some(Duration::from_secs(10)),
    }));
    let config = CacheConfig::new().tick_interval(Duration::from_millis(100));
    let cache = weather_cache(fetcher.clone(), config);
    let key = weather("indore");

    cache.warm([key.clone()]);
    wait_for(Duration::from_secs(1), || {
        cache.status(&key).unwrap().consecutive_failures == 1
    })
    .await;
    assert!(cache.status(&key).unwrap().next_due_in > Duration::from_secs(9));

    wait_for(Duration::from_secs(15), || fetcher.calls() == 2).await;
    let starts = fetcher.started_at();
    assert!(starts[1] - starts[0] >= Duration::from_secs(10));

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_refresh_on_next_read() {
    let fetcher = Arc::new(MockFetcher::new(TTL));
    let cache = weather_cache(fetcher.clone(), quiet());
    let key = weather("indore");

    assert!(!cache.invalidate(&key));
    let first = cache.get(&key).await.unwrap();
    // The refetch must produce a strictly newer snapshot to replace it.
    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(cache.invalidate(&key));

    // Still served, but now revalidating.
    let served = cache.get(&key).await.unwrap();
    assert_eq!(served.payload(), first.payload());
    wait_for(Duration::from_secs(1), || fetcher.calls() == 2).await;
    wait_for(Duration::from_secs(1), || {
        cache.try_get(&key).is_some_and(|s| s.payload()["seq"] == 2)
    })
    .await;

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn discarded_refreshes_back_off() {
    // Every refresh after the first returns a snapshot no newer than the
    // current one.
    let fetcher = Arc::new(MockFetcher::new(Duration::from_secs(60)).stamped_at(Instant::now()));
    let cache = weather_cache(
        fetcher.clone(),
        CacheConfig::new().tick_interval(Duration::from_secs(1)),
    );
    let key = weather("indore");

    let first = cache.get(&key).await.unwrap();
    tokio::time::sleep(Duration::from_secs(90)).await;

    // Due at 60s, then discards push the next attempt out by 1s, 2s, 4s
    // and 8s, leaving the sixth call at 75s and the seventh due at 91s.
    assert_eq!(fetcher.calls(), 6);
    let status = cache.status(&key).unwrap();
    assert_eq!(status.consecutive_failures, 5);
    assert!(status.next_due_in > Duration::ZERO);

    let served = cache.get(&key).await.unwrap();
    assert_eq!(served.payload(), first.payload());

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalidate_survives_a_discarded_refresh() {
    let fetcher = Arc::new(MockFetcher::new(TTL).stamped_at(Instant::now()));
    let cache = weather_cache(fetcher.clone(), quiet());
    let key = weather("indore");

    cache.get(&key).await.unwrap();
    assert!(cache.invalidate(&key));
    cache.get(&key).await.unwrap();
    wait_for(Duration::from_secs(1), || fetcher.calls() == 2).await;
    wait_for(Duration::from_secs(1), || {
        cache.status(&key).unwrap().state == RefreshState::Idle
    })
    .await;

    // The refetch was discarded: the key retries after backoff instead of
    // waiting out the full TTL again.
    let status = cache.status(&key).unwrap();
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.next_due_in <= Duration::from_secs(1));

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn warm_tracks_and_prefetches_keys() {
    let fetcher = Arc::new(MockFetcher::new(TTL));
    let cache = weather_cache(fetcher.clone(), quiet());
    let keys = vec![weather("indore"), weather("ujjain")];

    assert_eq!(cache.warm(keys.clone()), 2);
    assert_eq!(cache.len(), 2);
    // Already in flight: nothing new dispatched.
    assert_eq!(cache.warm(keys.clone()), 0);

    wait_for(Duration::from_secs(1), || {
        keys.iter().all(|k| cache.status(k).is_some_and(|s| s.has_snapshot))
    })
    .await;
    // Fresh keys are not refetched.
    assert_eq!(cache.warm(keys), 0);
    assert_eq!(fetcher.calls(), 2);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn saturated_queue_drops_dispatch_and_retries_on_tick() {
    let fetcher = Arc::new(MockFetcher::new(TTL).delay(Duration::from_secs(5)));
    let config = CacheConfig::new()
        .workers(1)
        .queue_depth(1)
        .tick_interval(Duration::from_secs(1));
    let cache = weather_cache(fetcher.clone(), config);
    let keys = vec![weather("a"), weather("b"), weather("c")];

    assert_eq!(cache.warm(keys.clone()), 1);
    let dropped = cache.status(&keys[1]).unwrap();
    assert_eq!(dropped.state, RefreshState::Idle);
    assert_eq!(dropped.consecutive_failures, 0);
    assert_eq!(dropped.next_due_in, Duration::ZERO);

    wait_for(Duration::from_secs(60), || {
        keys.iter().all(|k| cache.status(k).is_some_and(|s| s.has_snapshot))
    })
    .await;
    assert_eq!(fetcher.max_active(), 1);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn eager_refresh_ratio_refreshes_before_expiry() {
    let fetcher = Arc::new(MockFetcher::new(Duration::from_secs(100)));
    let config = CacheConfig::new()
        .tick_interval(Duration::from_secs(1))
        .refresh_ratio(0.5);
    let cache = weather_cache(fetcher.clone(), config);
    let key = weather("indore");

    cache.get(&key).await.unwrap();
    tokio::time::sleep(Duration::from_secs(49)).await;
    assert_eq!(fetcher.calls(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fetcher.calls(), 2);
    assert!(!cache.status(&key).unwrap().stale);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_entries_are_evicted() {
    let fetcher = Arc::new(MockFetcher::new(TTL));
    let config = CacheConfig::new()
        .tick_interval(Duration::from_secs(1))
        .idle_evict_after(Duration::from_secs(10));
    let cache = weather_cache(fetcher.clone(), config);
    let busy = weather("indore");
    let idle = weather("sehore");

    cache.get(&busy).await.unwrap();
    cache.get(&idle).await.unwrap();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cache.try_get(&busy).is_some());
    }

    assert!(cache.status(&idle).is_none());
    assert!(cache.status(&busy).is_some());
    assert_eq!(cache.len(), 1);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unregistered_source_is_rejected() {
    let fetcher = Arc::new(MockFetcher::new(TTL));
    let cache = weather_cache(fetcher, quiet());
    let key = Key::mandi("wheat", "indore").unwrap();

    let err = cache.get(&key).await.unwrap_err();
    assert!(matches!(err, CacheError::NoFetcher(Source::Mandi)));
    assert!(cache.status(&key).is_none());
    assert_eq!(cache.warm([key]), 0);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn get_str_parses_keys() {
    let fetcher = Arc::new(MockFetcher::new(TTL));
    let cache = weather_cache(fetcher, quiet());

    let snapshot = cache.get_str(" Weather:Indore ").await.unwrap();
    assert_eq!(snapshot.payload()["key"], "weather:indore");
    assert!(matches!(
        cache.get_str("weather").await,
        Err(CacheError::InvalidKey(_))
    ));

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_in_flight_refreshes() {
    let fetcher = Arc::new(MockFetcher::new(TTL).delay(Duration::from_secs(2)));
    let cache = weather_cache(fetcher.clone(), quiet());
    let warm = weather("indore");

    cache.warm([warm.clone()]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.in_flight(), 1);

    cache.shutdown().await;
    assert!(cache.status(&warm).unwrap().has_snapshot);
    assert_eq!(cache.in_flight(), 0);

    // Cached data stays readable; cold keys are refused.
    assert!(cache.get(&warm).await.is_ok());
    assert!(matches!(
        cache.get(&weather("ratlam")).await,
        Err(CacheError::ShuttingDown)
    ));
    // Idempotent.
    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_abandons_slow_refreshes() {
    let fetcher = Arc::new(MockFetcher::new(TTL).delay(Duration::from_secs(60)));
    let config = quiet().drain_timeout(Duration::from_secs(1));
    let cache = weather_cache(fetcher.clone(), config);
    let key = weather("indore");

    cache.warm([key.clone()]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 1);

    let started = Instant::now();
    cache.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let status = cache.status(&key).unwrap();
    assert_eq!(status.state, RefreshState::Idle);
    assert!(!status.has_snapshot);
    assert_eq!(status.consecutive_failures, 1);
}

#[tokio::test]
async fn builder_rejects_bad_configuration() {
    let fetcher = Arc::new(MockFetcher::new(TTL));

    let err = SnapshotCache::builder().build().err().unwrap();
    assert!(matches!(err, CacheError::Configuration(_)));

    for config in [
        CacheConfig::new().workers(0),
        CacheConfig::new().queue_depth(0),
        CacheConfig::new().refresh_ratio(0.0),
        CacheConfig::new().refresh_ratio(1.5),
        CacheConfig::new().tick_interval(Duration::ZERO),
    ] {
        let result = SnapshotCache::builder()
            .config(config)
            .fetcher(Source::Weather, fetcher.clone(), common::single_attempt())
            .build();
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }
}
