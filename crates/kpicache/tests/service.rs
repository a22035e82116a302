// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for reads, writes and invalidation.

use std::time::{Duration, SystemTime};

use kpicache::{CacheConfig, CacheError, CacheService, KPI_TAG, LoadOptions, Loader, dealership_tag, kpi_dealership_tag};
use kpicache_memory::InMemoryStore;
use kpicache_tier::{CacheEntry, EntryStore, KeyFilter};

type TestResult = Result<(), CacheError>;

fn cache() -> CacheService<String> {
    let config = CacheConfig {
        key_prefix: "kpi".to_owned(),
        ..CacheConfig::default()
    };
    CacheService::init(config).unwrap()
}

fn value(text: &str) -> Loader<String> {
    let text = text.to_owned();
    Loader::new(move || {
        let text = text.clone();
        async move { Ok::<_, std::io::Error>(text) }
    })
}

#[tokio::test]
async fn set_then_get() -> TestResult {
    let cache = cache();
    let key = cache.key("lead_volume", [("dealership_id", 1)])?;
    assert_eq!(key, "kpi:lead_volume:dealership_id=1");

    assert!(cache.get(&key).await?.is_none());
    cache.set(&key, "120".to_owned(), None, [KPI_TAG]).await?;

    let lookup = cache.get(&key).await?.unwrap();
    assert_eq!(lookup.value, "120");
    assert!(!lookup.stale);

    let stats = cache.stats();
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    Ok(())
}

#[tokio::test]
async fn set_replaces_value_and_tags() -> TestResult {
    let cache = cache();
    cache.set("k", "a".to_owned(), None, ["old"]).await?;
    cache.set("k", "b".to_owned(), None, ["new"]).await?;

    assert_eq!(cache.get("k").await?.unwrap().value, "b");
    assert!(cache.tagged_keys("old").is_empty());
    assert_eq!(cache.tagged_keys("new"), ["k"]);

    // The old tag no longer reaches the key.
    assert_eq!(cache.invalidate_tag("old").await?, 0);
    assert!(cache.get("k").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn invalidate_key_removes_entry_and_index() -> TestResult {
    let cache = cache();
    cache.set("k", "v".to_owned(), None, ["t"]).await?;
    cache.invalidate_key("k").await?;

    assert!(cache.get("k").await?.is_none());
    assert!(cache.tagged_keys("t").is_empty());
    assert!(cache.key_tags("k").is_empty());

    // Invalidating an absent key is not an error.
    cache.invalidate_key("absent").await?;
    Ok(())
}

#[tokio::test]
async fn invalidate_tag_removes_exactly_the_tagged_keys() -> TestResult {
    let cache = cache();
    let d1 = dealership_tag(1);
    let d2 = dealership_tag(2);

    cache.set("kpi:sales:dealership_id=1", "10".to_owned(), None, [KPI_TAG, d1.as_str()]).await?;
    cache.set("kpi:leads:dealership_id=1", "20".to_owned(), None, [KPI_TAG, d1.as_str()]).await?;
    cache.set("kpi:sales:dealership_id=2", "30".to_owned(), None, [KPI_TAG, d2.as_str()]).await?;

    assert_eq!(cache.invalidate_tag(&d1).await?, 2);

    assert!(cache.get("kpi:sales:dealership_id=1").await?.is_none());
    assert!(cache.get("kpi:leads:dealership_id=1").await?.is_none());
    assert_eq!(cache.get("kpi:sales:dealership_id=2").await?.unwrap().value, "30");
    assert_eq!(cache.tagged_keys(KPI_TAG), ["kpi:sales:dealership_id=2"]);
    assert!(cache.tagged_keys(&d1).is_empty());
    assert_eq!(cache.stats().invalidations, 2);
    Ok(())
}

#[tokio::test]
async fn invalidate_pattern_matches_keys_and_tags() -> TestResult {
    let cache = cache();
    cache.set("kpi:sales:dealership_id=1", "1".to_owned(), None, ["sales"]).await?;
    cache.set("kpi:sales:dealership_id=2", "2".to_owned(), None, ["sales"]).await?;
    cache.set("kpi:leads:dealership_id=1", "3".to_owned(), None, [kpi_dealership_tag("leads", 1)]).await?;
    cache.set("kpi:funnel", "4".to_owned(), None, ["funnel"]).await?;

    assert_eq!(cache.invalidate_pattern("kpi:sales:*").await?, 2);
    assert!(cache.get("kpi:sales:dealership_id=1").await?.is_none());
    assert!(cache.get("kpi:leads:dealership_id=1").await?.is_some());

    // A pattern that only matches a tag still reaches the tagged key.
    assert_eq!(cache.invalidate_pattern("leads_dealership_?").await?, 1);
    assert!(cache.get("kpi:leads:dealership_id=1").await?.is_none());
    assert!(cache.tagged_keys("leads_dealership_1").is_empty());

    assert_eq!(cache.get("kpi:funnel").await?.unwrap().value, "4");
    Ok(())
}

#[tokio::test]
async fn invalidate_pattern_rejects_empty_glob() {
    let cache = cache();
    for glob in ["", "   "] {
        let error = cache.invalidate_pattern(glob).await.unwrap_err();
        assert!(matches!(error, CacheError::InvalidPattern { .. }), "got {error:?}");
    }
}

#[tokio::test]
async fn get_or_load_caches_and_groups() -> TestResult {
    let cache = cache();
    let options = LoadOptions::new().tag(KPI_TAG).group("lead_volume");

    let first = cache.get_or_load("k", options.clone(), value("7")).await?;
    assert_eq!(first.value, "7");
    let second = cache.get_or_load("k", options, value("8")).await?;
    assert_eq!(second.value, "7");

    let group = cache.group_stats("lead_volume").unwrap();
    assert_eq!(group.misses, 1);
    assert_eq!(group.hits, 1);
    assert_eq!(group.sets, 1);
    assert_eq!(cache.stat_groups(), ["lead_volume"]);
    assert_eq!(cache.tagged_keys(KPI_TAG), ["k"]);
    Ok(())
}

#[tokio::test]
async fn failed_load_caches_nothing() -> TestResult {
    let cache = cache();
    let failing: Loader<String> = Loader::new(|| async { Err(std::io::Error::other("warehouse down")) });

    let error = cache
        .get_or_load("k", LoadOptions::new().tag("t"), failing)
        .await
        .unwrap_err();
    assert!(matches!(error, CacheError::Factory(_)));
    assert_eq!(error.to_string(), "loader failed: warehouse down");

    assert!(cache.get("k").await?.is_none());
    assert!(cache.tagged_keys("t").is_empty());
    assert_eq!(cache.stats().errors, 1);

    let recovered = cache.get_or_load("k", LoadOptions::new(), value("ok")).await?;
    assert_eq!(recovered.value, "ok");
    Ok(())
}

#[tokio::test]
async fn registered_loader_serves_plain_get() -> TestResult {
    let cache = cache();
    cache.register_loader("k", LoadOptions::new().ttl(Duration::from_secs(60)), value("loaded"));

    assert_eq!(cache.get("k").await?.unwrap().value, "loaded");
    assert!(cache.unregister_loader("k"));
    assert!(!cache.unregister_loader("k"));

    // Still cached after the loader is gone.
    assert_eq!(cache.get("k").await?.unwrap().value, "loaded");
    Ok(())
}

#[tokio::test]
async fn stats_snapshot_serializes() -> TestResult {
    let cache = cache();
    cache.set("k", "v".to_owned(), None, Vec::<String>::new()).await?;
    let _ = cache.get("k").await?;
    let _ = cache.get("missing").await?;

    let json = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(json["hits"], 1);
    assert_eq!(json["misses"], 1);
    assert_eq!(json["hit_rate"], 0.5);
    assert_eq!(json["latency_samples"], 2);

    cache.reset_stats();
    assert_eq!(cache.stats().hits, 0);
    Ok(())
}

#[tokio::test]
async fn health_reports_memory_backend() {
    let cache = cache();
    let health = serde_json::to_value(cache.health_check()).unwrap();
    assert_eq!(health, serde_json::json!({ "backend": "memory", "degraded": false }));
}

#[tokio::test]
async fn clones_share_state() -> TestResult {
    let cache = cache();
    let other = cache.clone();
    cache.set("k", "v".to_owned(), None, ["t"]).await?;
    assert_eq!(other.get("k").await?.unwrap().value, "v");
    other.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn write_during_tag_invalidation_stays_indexed() -> TestResult {
    let cache = CacheService::builder(CacheConfig::default())
        .memory(SlowInvalidate(InMemoryStore::new()))
        .build()
        .unwrap();
    cache.set("k", "old".to_owned(), None, [KPI_TAG]).await?;

    let invalidation = tokio::spawn({
        let cache = cache.clone();
        async move { cache.invalidate_tag(KPI_TAG).await }
    });
    // Let the invalidation reach the slow store before writing again.
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.set("k", "new".to_owned(), None, [KPI_TAG]).await?;
    assert_eq!(invalidation.await.unwrap()?, 1);

    assert_eq!(cache.get("k").await?.unwrap().value, "new");
    assert_eq!(cache.tagged_keys(KPI_TAG), ["k"]);
    assert_eq!(cache.invalidate_tag(KPI_TAG).await?, 1);
    assert!(cache.get("k").await?.is_none());
    Ok(())
}

/// An in-process store that lingers after each invalidation.
#[derive(Debug)]
struct SlowInvalidate(InMemoryStore<String>);

impl EntryStore<String> for SlowInvalidate {
    async fn get(&self, key: &str) -> kpicache_tier::Result<Option<CacheEntry<String>>> {
        self.0.get(key).await
    }

    async fn insert(&self, key: &str, entry: CacheEntry<String>) -> kpicache_tier::Result<bool> {
        self.0.insert(key, entry).await
    }

    async fn compare_and_insert(&self, key: &str, expected: u64, entry: CacheEntry<String>) -> kpicache_tier::Result<bool> {
        self.0.compare_and_insert(key, expected, entry).await
    }

    async fn invalidate(&self, key: &str) -> kpicache_tier::Result<()> {
        self.0.invalidate(key).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn clear(&self) -> kpicache_tier::Result<()> {
        self.0.clear().await
    }

    async fn keys(&self, filter: &KeyFilter) -> kpicache_tier::Result<Vec<String>> {
        self.0.keys(filter).await
    }

    async fn evict_expired(&self, now: SystemTime) -> kpicache_tier::Result<Vec<String>> {
        self.0.evict_expired(now).await
    }

    async fn ping(&self) -> kpicache_tier::Result<()> {
        self.0.ping().await
    }

    fn name(&self) -> &'static str {
        "slow-invalidate"
    }
}
