// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for scheduled warm-up.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use kpicache::{CacheConfig, CacheService, LoadOptions, Loader};

fn counting(calls: &Arc<AtomicUsize>) -> Loader<usize> {
    let calls = Arc::clone(calls);
    Loader::new(move || {
        let calls = Arc::clone(&calls);
        async move { Ok::<_, io::Error>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
    })
}

#[tokio::test(start_paused = true)]
async fn warm_loads_now_and_on_every_interval() {
    let cache = CacheService::<usize>::init(CacheConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.warm("leaderboard", LoadOptions::new().tag("kpi").group("leaderboard"), counting(&calls), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("leaderboard").await.unwrap().unwrap().value, 1);
    assert_eq!(cache.tagged_keys("kpi"), ["leaderboard"]);

    tokio::time::sleep(Duration::from_secs(125)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.get("leaderboard").await.unwrap().unwrap().value, 3);
    assert_eq!(cache.warmed_keys(), ["leaderboard"]);
    assert_eq!(cache.group_stats("leaderboard").unwrap().sets, 3);
}

#[tokio::test(start_paused = true)]
async fn failing_ticks_keep_the_schedule_and_other_keys() {
    let cache = CacheService::<usize>::init(CacheConfig::default()).unwrap();
    let failures = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&failures);
    let failing: Loader<usize> = Loader::new(move || {
        let failures = Arc::clone(&counted);
        async move {
            failures.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("query failed"))
        }
    });
    let calls = Arc::new(AtomicUsize::new(0));

    cache.warm("broken", LoadOptions::new().group("broken"), failing, Duration::from_secs(10));
    cache.warm("healthy", LoadOptions::new(), counting(&calls), Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.group_stats("broken").unwrap().errors, 3);
    assert_eq!(cache.warmed_keys(), ["broken", "healthy"]);
}

#[tokio::test(start_paused = true)]
async fn unwarm_stops_the_schedule_and_forgets_the_loader() {
    let cache = CacheService::<usize>::init(CacheConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.warm("k", LoadOptions::new(), counting(&calls), Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(cache.unwarm("k"));
    assert!(!cache.unwarm("k"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.warmed_keys().is_empty());

    // Without the loader an invalidated key stays empty.
    cache.invalidate_key("k").await.unwrap();
    assert!(cache.get("k").await.unwrap().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_warming() {
    let cache = CacheService::<usize>::init(CacheConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.warm("k", LoadOptions::new(), counting(&calls), Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(1)).await;
    cache.shutdown().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.warmed_keys().is_empty());
}
