use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use agripulse::{BackoffConfig, CommitOutcome, FetchError, Key, RefreshState, Snapshot, SnapshotStore};

fn key() -> Key {
    Key::mandi("wheat", "indore").unwrap()
}

fn snapshot_at(fetched_at: Instant, seq: u64) -> Snapshot {
    Snapshot::with_fetched_at(json!({ "seq": seq }), fetched_at, Duration::from_secs(900))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_caller_begins_a_refresh() {
    let store = Arc::new(SnapshotStore::new());
    let key = key();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.try_begin_refresh(&key) })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[test]
fn concurrent_commits_keep_the_newest_snapshot() {
    let store = Arc::new(SnapshotStore::new());
    let key = key();
    let base = Instant::now();

    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let store = store.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                // Each thread commits its own interleaving of timestamps.
                for i in 0..50u64 {
                    let seq = (i * 8 + t * 13) % 400;
                    let snapshot = snapshot_at(base + Duration::from_millis(seq), seq);
                    store.commit(&key, snapshot, &BackoffConfig::new());
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let current = store.read(&key).snapshot.unwrap();
    let newest = (0..8u64)
        .flat_map(|t| (0..50u64).map(move |i| (i * 8 + t * 13) % 400))
        .max()
        .unwrap();
    assert_eq!(current.payload()["seq"], newest);
}

#[test]
fn out_of_order_commit_is_discarded() {
    let store = SnapshotStore::new();
    let key = key();
    let t1 = Instant::now();
    let t2 = t1 + Duration::from_secs(5);

    let backoff = BackoffConfig::new();

    assert!(store.try_begin_refresh(&key));
    assert_eq!(store.commit(&key, snapshot_at(t2, 2), &backoff), CommitOutcome::Applied);
    assert_eq!(store.commit(&key, snapshot_at(t1, 1), &backoff), CommitOutcome::Discarded);
    assert_eq!(store.commit(&key, snapshot_at(t2, 3), &backoff), CommitOutcome::Discarded);

    let lookup = store.read(&key);
    assert_eq!(lookup.snapshot.unwrap().payload()["seq"], 2);
    assert!(!lookup.refreshing);
}

#[tokio::test(start_paused = true)]
async fn discarded_commit_backs_off_without_clearing_failures() {
    let store = SnapshotStore::new();
    let key = key();
    let backoff = BackoffConfig::new();
    let t0 = Instant::now();

    store.commit(&key, snapshot_at(t0, 1), &backoff);
    assert!(store.try_begin_refresh(&key));
    store.fail(&key, FetchError::Upstream("HTTP 502".into()), &backoff);
    assert!(store.invalidate(&key));

    // Same observation again: neither the TTL nor a reset counter applies.
    assert!(store.try_begin_refresh(&key));
    assert_eq!(store.commit(&key, snapshot_at(t0, 2), &backoff), CommitOutcome::Discarded);
    let status = store.status(&key).unwrap();
    assert_eq!(status.state, RefreshState::Idle);
    assert_eq!(status.consecutive_failures, 2);
    assert_eq!(status.next_due_in, Duration::from_secs(2));
    assert_eq!(status.last_error, Some(FetchError::Upstream("HTTP 502".into())));

    tokio::time::advance(Duration::from_secs(2)).await;
    let t1 = Instant::now();
    assert!(store.try_begin_refresh(&key));
    assert_eq!(store.commit(&key, snapshot_at(t1, 3), &backoff), CommitOutcome::Applied);
    let status = store.status(&key).unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.last_error, None);
    assert_eq!(status.next_due_in, Duration::from_secs(900));
}

#[tokio::test(start_paused = true)]
async fn failure_leaves_snapshot_and_schedules_backoff() {
    let store = SnapshotStore::new();
    let key = key();
    let backoff = BackoffConfig::new().max(Duration::from_secs(4));

    store.commit(&key, Snapshot::new(json!({"seq": 1}), Duration::from_secs(900)), &backoff);
    for (failures, expected) in [(1, 1), (2, 2), (3, 4), (4, 4)] {
        assert!(store.try_begin_refresh(&key));
        let delay = store.fail(&key, FetchError::Timeout(Duration::from_secs(10)), &backoff);
        assert_eq!(delay, Duration::from_secs(expected));
        let status = store.status(&key).unwrap();
        assert_eq!(status.consecutive_failures, failures);
        assert_eq!(status.next_due_in, Duration::from_secs(expected));
        assert_eq!(status.state, RefreshState::Idle);
        assert!(status.has_snapshot);
    }
}

#[tokio::test(start_paused = true)]
async fn commit_wakes_subscribers() {
    let store = Arc::new(SnapshotStore::new());
    let key = key();
    let mut commits = store.subscribe(&key);

    let writer = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let snapshot = Snapshot::new(json!({"seq": 1}), Duration::from_secs(900));
            store.commit(&key, snapshot, &BackoffConfig::new());
        })
    };

    commits.changed().await.unwrap();
    assert!(store.read(&key).snapshot.is_some());
    writer.await.unwrap();
}
