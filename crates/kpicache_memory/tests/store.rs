// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `InMemoryStore`.

use std::time::{Duration, SystemTime};

use kpicache_memory::{InMemoryStore, InMemoryStoreBuilder};
use kpicache_tier::{CacheEntry, EntryStore, ExpiryPolicy, KeyFilter};

const T0: SystemTime = SystemTime::UNIX_EPOCH;

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    futures::executor::block_on(f)
}

fn entry(value: i32, version: u64) -> CacheEntry<i32> {
    CacheEntry::new(value, T0, ExpiryPolicy::new(Duration::from_secs(30), 0.8)).with_version(version)
}

#[test]
fn new_store_is_empty() {
    let store = InMemoryStore::<i32>::new();
    assert_eq!(store.len(), Some(0));
    assert_eq!(store.name(), "memory");

    let bounded = InMemoryStore::<i32>::with_capacity(10);
    assert_eq!(bounded.len(), Some(0));
}

#[test]
fn get_returns_none_for_missing_key() {
    block_on(async {
        let store = InMemoryStore::<i32>::new();
        assert!(store.get("missing").await.expect("get failed").is_none());
    });
}

#[test]
fn insert_and_get_returns_entry() {
    block_on(async {
        let store = InMemoryStore::new();
        assert!(store.insert("key", entry(42, 1).with_tags(["kpi"])).await.expect("insert failed"));

        let found = store.get("key").await.expect("get failed").expect("entry should exist");
        assert_eq!(*found.value(), 42);
        assert!(found.has_tag("kpi"));
    });
}

#[test]
fn insert_never_downgrades_version() {
    block_on(async {
        let store = InMemoryStore::new();
        store.insert("key", entry(1, 10)).await.unwrap();

        assert!(!store.insert("key", entry(2, 9)).await.unwrap());
        assert_eq!(*store.get("key").await.unwrap().unwrap().value(), 1);

        assert!(store.insert("key", entry(3, 10)).await.unwrap());
        assert_eq!(*store.get("key").await.unwrap().unwrap().value(), 3);
    });
}

#[test]
fn compare_and_insert_checks_version() {
    block_on(async {
        let store = InMemoryStore::new();
        assert!(!store.compare_and_insert("key", 0, entry(1, 1)).await.unwrap());

        store.insert("key", entry(1, 4)).await.unwrap();
        assert!(!store.compare_and_insert("key", 3, entry(2, 5)).await.unwrap());
        assert!(store.compare_and_insert("key", 4, entry(3, 5)).await.unwrap());

        let found = store.get("key").await.unwrap().unwrap();
        assert_eq!((*found.value(), found.version()), (3, 5));
    });
}

#[test]
fn invalidate_removes_entry() {
    block_on(async {
        let store = InMemoryStore::new();
        store.insert("key", entry(1, 1)).await.unwrap();
        store.invalidate("key").await.unwrap();
        assert!(store.get("key").await.unwrap().is_none());
    });
}

#[test]
fn clear_removes_everything() {
    block_on(async {
        let store = InMemoryStore::new();
        store.insert("a", entry(1, 1)).await.unwrap();
        store.insert("b", entry(2, 2)).await.unwrap();
        store.clear().await.unwrap();

        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_none());
    });
}

#[test]
fn keys_by_tag_and_pattern() {
    block_on(async {
        let store = InMemoryStore::new();
        store.insert("kpi:leads:dealershipId=1", entry(1, 1).with_tags(["dealership_1"])).await.unwrap();
        store.insert("kpi:leads:dealershipId=2", entry(2, 2).with_tags(["dealership_2"])).await.unwrap();
        store.insert("http:GET:/health", entry(3, 3)).await.unwrap();

        let tagged = store.keys(&KeyFilter::tag("dealership_2")).await.unwrap();
        assert_eq!(tagged, vec!["kpi:leads:dealershipId=2"]);

        let matched = store.keys(&KeyFilter::pattern("kpi:leads:*").unwrap()).await.unwrap();
        assert_eq!(matched, vec!["kpi:leads:dealershipId=1", "kpi:leads:dealershipId=2"]);

        assert_eq!(store.keys(&KeyFilter::All).await.unwrap().len(), 3);
    });
}

#[test]
fn evict_expired_leaves_live_entries() {
    block_on(async {
        let store = InMemoryStore::new();
        store
            .insert("short", CacheEntry::new(1, T0, ExpiryPolicy::new(Duration::from_secs(1), 0.8)))
            .await
            .unwrap();
        store.insert("long", entry(2, 1)).await.unwrap();

        let evicted = store.evict_expired(T0 + Duration::from_secs(2)).await.unwrap();
        assert_eq!(evicted, vec!["short"]);
        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.get("long").await.unwrap().is_some());
    });
}

#[test]
fn builder_options_build_working_store() {
    block_on(async {
        let store = InMemoryStoreBuilder::<i32>::new()
            .max_capacity(100)
            .max_lifetime(Duration::from_secs(600))
            .name("test-memory")
            .build();

        store.insert("key", entry(5, 1)).await.unwrap();
        store.ping().await.unwrap();
        assert_eq!(*store.get("key").await.unwrap().unwrap().value(), 5);
    });
}
