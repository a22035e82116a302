// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Behavior of `RedisStore` when no server is listening.

use std::time::{Duration, Instant, SystemTime};

use kpicache_redis::{RedisConfig, RedisStore};
use kpicache_tier::{CacheEntry, EntryStore, ExpiryPolicy, KeyFilter};

fn unreachable_store() -> RedisStore<String> {
    let config = RedisConfig {
        url: "redis://127.0.0.1:1".to_owned(),
        connect_timeout_ms: 200,
        ..RedisConfig::default()
    };
    RedisStore::new(&config).expect("url is valid")
}

#[tokio::test]
async fn ping_reports_unavailable() {
    let store = unreachable_store();
    let started = Instant::now();

    let error = store.ping().await.expect_err("nothing listens on port 1");
    assert!(error.is_unavailable(), "unexpected error: {error}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn every_operation_reports_unavailable() {
    let store = unreachable_store();
    let entry = CacheEntry::new("v".to_owned(), SystemTime::now(), ExpiryPolicy::default());

    assert!(store.get("k").await.unwrap_err().is_unavailable());
    assert!(store.insert("k", entry).await.unwrap_err().is_unavailable());
    assert!(store.invalidate("k").await.unwrap_err().is_unavailable());
    assert!(store.keys(&KeyFilter::All).await.unwrap_err().is_unavailable());
}

#[tokio::test]
async fn evict_expired_is_a_no_op() {
    let store = unreachable_store();
    assert!(store.evict_expired(SystemTime::now()).await.unwrap().is_empty());
    assert_eq!(store.len(), None);
    assert_eq!(store.name(), "redis");
}
