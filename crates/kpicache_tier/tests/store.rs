// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for the `EntryStore` contract using `MockStore` and `DynamicStore`.

use std::time::{Duration, SystemTime};

use kpicache_tier::{
    CacheEntry, DynamicStoreExt, EntryStore, ExpiryPolicy, KeyFilter, StoreErrorKind,
    testing::{MockStore, StoreOp},
};

const T0: SystemTime = SystemTime::UNIX_EPOCH;

fn entry(value: i32, version: u64) -> CacheEntry<i32> {
    CacheEntry::new(value, T0, ExpiryPolicy::new(Duration::from_secs(30), 0.8)).with_version(version)
}

#[tokio::test]
async fn insert_keeps_higher_version() {
    let store = MockStore::new();

    assert!(store.insert("k", entry(1, 5)).await.unwrap());
    assert!(!store.insert("k", entry(2, 3)).await.unwrap());
    assert_eq!(*store.get("k").await.unwrap().unwrap().value(), 1);

    assert!(store.insert("k", entry(3, 6)).await.unwrap());
    assert_eq!(*store.get("k").await.unwrap().unwrap().value(), 3);
}

#[tokio::test]
async fn compare_and_insert_requires_matching_version() {
    let store = MockStore::new();
    store.insert("k", entry(1, 5)).await.unwrap();

    assert!(!store.compare_and_insert("k", 4, entry(2, 9)).await.unwrap());
    assert!(store.compare_and_insert("k", 5, entry(3, 9)).await.unwrap());
    assert_eq!(store.peek("k").unwrap().version(), 9);

    assert!(!store.compare_and_insert("missing", 0, entry(4, 10)).await.unwrap());
    assert!(!store.contains_key("missing"));
}

#[tokio::test]
async fn keys_honor_filters() {
    let store = MockStore::new();
    store.insert("kpi:a", entry(1, 1).with_tags(["kpi"])).await.unwrap();
    store.insert("kpi:b", entry(2, 2).with_tags(["kpi", "dealership_1"])).await.unwrap();
    store.insert("http:c", entry(3, 3)).await.unwrap();

    assert_eq!(store.keys(&KeyFilter::All).await.unwrap(), vec!["http:c", "kpi:a", "kpi:b"]);
    assert_eq!(store.keys(&KeyFilter::tag("dealership_1")).await.unwrap(), vec!["kpi:b"]);
    assert_eq!(store.keys(&KeyFilter::pattern("kpi:*").unwrap()).await.unwrap(), vec!["kpi:a", "kpi:b"]);
}

#[tokio::test]
async fn evict_expired_removes_only_expired() {
    let store = MockStore::new();
    let short = CacheEntry::new(1, T0, ExpiryPolicy::new(Duration::from_secs(5), 0.8));
    store.insert("short", short).await.unwrap();
    store.insert("long", entry(2, 1)).await.unwrap();

    let evicted = store.evict_expired(T0 + Duration::from_secs(5)).await.unwrap();
    assert_eq!(evicted, vec!["short"]);
    assert!(store.contains_key("long"));
}

#[tokio::test]
async fn offline_store_reports_unavailable() {
    let store: MockStore<i32> = MockStore::new();
    store.set_offline(true);

    let err = store.ping().await.unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(err.store(), "mock");

    store.set_offline(false);
    store.ping().await.unwrap();
}

#[tokio::test]
async fn injected_failures_are_operation_errors() {
    let store: MockStore<i32> = MockStore::new();
    store.fail_when(|op| matches!(op, StoreOp::Invalidate(key) if key == "locked"));

    let err = store.invalidate("locked").await.unwrap_err();
    assert_eq!(err.kind(), StoreErrorKind::Operation);
    store.invalidate("free").await.unwrap();

    store.clear_failures();
    store.invalidate("locked").await.unwrap();

    assert_eq!(
        store.operations(),
        vec![
            StoreOp::Invalidate("locked".to_owned()),
            StoreOp::Invalidate("free".to_owned()),
            StoreOp::Invalidate("locked".to_owned()),
        ]
    );
    store.clear_operations();
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn dynamic_store_delegates() {
    let mock = MockStore::new();
    let dynamic = mock.clone().into_dynamic();
    let copy = dynamic.clone();

    assert!(dynamic.insert("k", entry(7, 1)).await.unwrap());
    assert_eq!(*copy.get("k").await.unwrap().unwrap().value(), 7);
    assert_eq!(copy.len(), Some(1));
    assert_eq!(copy.name(), "mock");
    assert!(mock.contains_key("k"));

    copy.clear().await.unwrap();
    assert_eq!(dynamic.len(), Some(0));
}
