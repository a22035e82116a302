// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A dashboard backend: KPI reads go through the cache, a warm-up keeps the
//! leaderboard hot and ETL events invalidate what they touched.
//!
//! Run with `RUST_LOG=debug` to see every cache event.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use kpicache::{CacheConfig, CacheError, CacheService, KPI_TAG, LoadOptions, Loader, dealership_tag, kpi_dealership_tag};
use tracing_subscriber::EnvFilter;

/// Stands in for the analytics warehouse.
#[derive(Clone, Default)]
struct Warehouse {
    queries: Arc<AtomicU32>,
}

impl Warehouse {
    async fn lead_volume(&self, dealership_id: u32) -> Result<f64, std::io::Error> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(f64::from(dealership_id) * 12.5)
    }

    fn loader(&self, dealership_id: u32) -> Loader<f64> {
        let warehouse = self.clone();
        Loader::new(move || {
            let warehouse = warehouse.clone();
            async move { warehouse.lead_volume(dealership_id).await }
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), CacheError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CacheConfig {
        key_prefix: "kpi".to_owned(),
        default_ttl_ms: 30_000,
        ..CacheConfig::default()
    };
    let cache = CacheService::<f64>::init(config).expect("valid configuration");
    let warehouse = Warehouse::default();

    let options = |dealership_id: u32| {
        LoadOptions::new()
            .tag(KPI_TAG)
            .tag(dealership_tag(dealership_id))
            .tag(kpi_dealership_tag("lead_volume", dealership_id))
            .group("lead_volume")
    };

    // Ten widgets ask for the same KPI at once; the warehouse sees one query.
    let key = cache.key("lead_volume", [("dealership_id", 7)])?;
    let widgets = (0..10).map(|_| cache.get_or_load(&key, options(7), warehouse.loader(7)));
    for lookup in futures::future::join_all(widgets).await {
        println!("lead volume for dealership 7: {}", lookup?.value);
    }
    println!("warehouse queries so far: {}", warehouse.queries.load(Ordering::Relaxed));

    // Keep the leaderboard dealership hot.
    let hot = cache.key("lead_volume", [("dealership_id", 1)])?;
    cache.warm(&hot, options(1), warehouse.loader(1), Duration::from_secs(10));
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("warm value: {:?}", cache.get(&hot).await?.map(|lookup| lookup.value));

    // The ETL pipeline reports fresh lead data for dealership 7.
    let invalidated = cache
        .on_event("etl", "leads_updated", &serde_json::json!({ "dealership_id": 7 }))
        .await;
    println!("event invalidated tags: {invalidated:?}");
    println!("dealership 7 cached after event: {}", cache.get(&key).await?.is_some());

    println!("health: {}", serde_json::to_string(&cache.health_check()).unwrap_or_default());
    println!("stats: {}", serde_json::to_string_pretty(&cache.stats()).unwrap_or_default());

    cache.shutdown().await;
    Ok(())
}
