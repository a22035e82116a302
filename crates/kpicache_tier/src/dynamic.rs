// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Type-erased store wrapper.

use std::{fmt::Debug, sync::Arc, time::SystemTime};

use crate::{CacheEntry, EntryStore, KeyFilter, Result, tier::DynEntryStore};

/// Extension trait for converting any `EntryStore` into a `DynamicStore`.
///
/// This trait is automatically implemented for all types that implement `EntryStore`.
///
/// # Examples
///
/// ```
/// use kpicache_tier::{DynamicStore, DynamicStoreExt, EntryStore};
///
/// fn erase<S>(store: S) -> DynamicStore<i32>
/// where
///     S: EntryStore<i32> + 'static,
/// {
///     store.into_dynamic()
/// }
/// ```
pub trait DynamicStoreExt<V>: Sized {
    /// Converts this store into a `DynamicStore`.
    fn into_dynamic(self) -> DynamicStore<V>;
}

impl<V, S> DynamicStoreExt<V> for S
where
    S: EntryStore<V> + 'static,
{
    fn into_dynamic(self) -> DynamicStore<V> {
        DynamicStore::new(self)
    }
}

/// A clonable store with type erasure.
///
/// Wraps a trait object in an `Arc` so the memory and distributed tiers can be
/// held side by side regardless of their concrete types.
pub struct DynamicStore<V>(Arc<DynEntryStore<'static, V>>);

impl<V> DynamicStore<V> {
    pub(crate) fn new<S>(store: S) -> Self
    where
        S: EntryStore<V> + 'static,
    {
        Self(DynEntryStore::new_arc(store))
    }
}

impl<V> Debug for DynamicStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicStore").field("name", &self.0.name()).finish()
    }
}

impl<V> Clone for DynamicStore<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V> EntryStore<V> for DynamicStore<V>
where
    V: Send,
{
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        self.0.get(key).await
    }

    async fn insert(&self, key: &str, entry: CacheEntry<V>) -> Result<bool> {
        self.0.insert(key, entry).await
    }

    async fn compare_and_insert(&self, key: &str, expected: u64, entry: CacheEntry<V>) -> Result<bool> {
        self.0.compare_and_insert(key, expected, entry).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.0.invalidate(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.0.clear().await
    }

    async fn keys(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        self.0.keys(filter).await
    }

    async fn evict_expired(&self, now: SystemTime) -> Result<Vec<String>> {
        self.0.evict_expired(now).await
    }

    async fn ping(&self) -> Result<()> {
        self.0.ping().await
    }

    fn len(&self) -> Option<u64> {
        self.0.len()
    }

    fn name(&self) -> &'static str {
        self.0.name()
    }
}
