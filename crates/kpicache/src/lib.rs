// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Caching and invalidation for KPI dashboards.
//!
//! [`CacheService`] sits between dashboard handlers and slow KPI queries:
//! - Deterministic keys from a namespace and parameters via [`KeyBuilder`]
//! - A moka-backed memory tier with an optional distributed tier behind it
//! - Invalidation by key, by tag and by glob pattern
//! - Single-flight loading, so concurrent misses run one query
//! - Stale-while-revalidate with one background refresh per key
//! - Scheduled warm-up of hot keys
//! - Domain events mapped to tag invalidations through an [`EventMappingTable`]
//! - Hit, miss and latency counters per KPI group
//!
//! When the distributed tier cannot be reached the service keeps serving
//! from memory, reports itself degraded through [`CacheService::health_check`]
//! and replays missed invalidations once the tier is back.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use kpicache::{CacheConfig, CacheService, LoadOptions, Loader, dealership_tag};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheService::<f64>::init(CacheConfig::default())?;
//! let key = cache.key("conversion_rate", [("dealership_id", 42), ("window", 30)])?;
//!
//! let options = LoadOptions::new()
//!     .ttl(Duration::from_secs(60))
//!     .tag("kpi")
//!     .tag(dealership_tag(42))
//!     .group("conversion");
//! let rate = cache
//!     .get_or_load(&key, options, Loader::new(|| async { Ok::<_, std::io::Error>(0.31) }))
//!     .await?;
//! assert!(!rate.stale);
//!
//! // The ETL reports new lead data for dealership 42.
//! let tags = cache
//!     .on_event("etl", "leads_updated", &serde_json::json!({ "dealership_id": 42 }))
//!     .await;
//! assert_eq!(tags, ["leads", "dealership_42"]);
//! assert!(cache.get(&key).await?.is_none());
//! # Ok(())
//! # }
//! ```

mod bridge;
pub mod builder;
mod config;
mod error;
mod flight;
mod health;
mod key;
mod loader;
mod locks;
mod refresh;
pub mod service;
mod stats;
mod tags;
mod telemetry;
mod tiered;
mod warmer;

#[doc(inline)]
pub use bridge::{EventMappingTable, EventRule};
#[doc(inline)]
pub use builder::CacheServiceBuilder;
#[doc(inline)]
pub use config::CacheConfig;
#[doc(inline)]
pub use error::{BoxError, CacheError, ConfigError};
#[doc(inline)]
pub use health::{Backend, Health};
#[doc(inline)]
pub use key::{KPI_TAG, KeyBuilder, dealership_tag, kpi_dealership_tag};
#[doc(inline)]
pub use kpicache_memory::InMemoryStore;
#[doc(inline)]
pub use kpicache_tier::{CacheEntry, Clock, EntryStore, StoreError};
#[doc(inline)]
pub use loader::{LoadOptions, Loader, Lookup};
#[doc(inline)]
pub use service::CacheService;
#[doc(inline)]
pub use stats::{LATENCY_BUCKETS_MS, LatencyBucket, StatsSnapshot};

#[cfg(any(feature = "test-util", test))]
#[doc(inline)]
pub use kpicache_tier::{
    ClockControl,
    testing::{MockStore, StoreOp},
};
