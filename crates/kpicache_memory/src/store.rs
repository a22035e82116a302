// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory store implementation using moka.

use std::{future::ready, sync::Arc, time::SystemTime};

use kpicache_tier::{CacheEntry, EntryStore, KeyFilter, Result};
use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
};

use crate::builder::InMemoryStoreBuilder;

const NAME: &str = "memory";

/// An in-memory store backed by moka.
///
/// Version rules are applied atomically per key through moka's compute API, so
/// concurrent writers to one key cannot interleave between the version check
/// and the write.
///
/// # Examples
///
/// ```
/// use kpicache_memory::InMemoryStore;
/// use kpicache_tier::{CacheEntry, EntryStore, ExpiryPolicy};
/// use std::time::SystemTime;
/// # futures::executor::block_on(async {
///
/// let store = InMemoryStore::<i32>::new();
/// let entry = CacheEntry::new(42, SystemTime::now(), ExpiryPolicy::default());
///
/// store.insert("key", entry).await.unwrap();
/// let value = store.get("key").await.unwrap();
/// assert_eq!(*value.unwrap().value(), 42);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Cache<String, CacheEntry<V>>>,
}

impl<V> Default for InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a store holding at most `max_capacity` entries.
    #[must_use]
    pub fn with_capacity(max_capacity: u64) -> Self {
        Self::builder().max_capacity(max_capacity).build()
    }

    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> InMemoryStoreBuilder<V> {
        InMemoryStoreBuilder::new()
    }

    pub(crate) fn from_builder(builder: &InMemoryStoreBuilder<V>) -> Self {
        let mut moka_builder = Cache::builder();

        if let Some(capacity) = builder.max_capacity {
            moka_builder = moka_builder.max_capacity(capacity);
        }

        if let Some(lifetime) = builder.max_lifetime {
            moka_builder = moka_builder.time_to_live(lifetime);
        }

        if let Some(name) = builder.name.as_deref() {
            moka_builder = moka_builder.name(name);
        }

        Self {
            inner: Arc::new(moka_builder.build()),
        }
    }
}

impl<V> EntryStore<V> for InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        Ok(self.inner.get(key).await)
    }

    async fn insert(&self, key: &str, entry: CacheEntry<V>) -> Result<bool> {
        let result = self
            .inner
            .entry_by_ref(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(current) if current.value().version() > entry.version() => Op::Nop,
                    _ => Op::Put(entry),
                };
                ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_)))
    }

    async fn compare_and_insert(&self, key: &str, expected: u64, entry: CacheEntry<V>) -> Result<bool> {
        let result = self
            .inner
            .entry_by_ref(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(current) if current.value().version() == expected => Op::Put(entry),
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.inner.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.invalidate_all();
        Ok(())
    }

    async fn keys(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(key, entry)| filter.matches(key, entry))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn evict_expired(&self, now: SystemTime) -> Result<Vec<String>> {
        let candidates: Vec<Arc<String>> = self
            .inner
            .iter()
            .filter(|(_, entry)| entry.hard_expires_at() <= now)
            .map(|(key, _)| key)
            .collect();

        // Re-check under the per-key lock; a writer may have replaced the entry since the scan.
        let mut evicted = Vec::with_capacity(candidates.len());
        for key in candidates {
            let result = self
                .inner
                .entry_by_ref(key.as_str())
                .and_compute_with(|existing| {
                    let op = match existing {
                        Some(current) if current.value().hard_expires_at() <= now => Op::Remove,
                        _ => Op::Nop,
                    };
                    ready(op)
                })
                .await;
            if matches!(result, CompResult::Removed(_)) {
                evicted.push(key.as_ref().clone());
            }
        }
        evicted.sort();
        Ok(evicted)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        Some(self.inner.entry_count())
    }

    fn name(&self) -> &'static str {
        NAME
    }
}
