// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::marker::PhantomData;
use std::time::Duration;

use crate::store::InMemoryStore;

/// Configures an [`InMemoryStore`].
///
/// Entry deadlines are enforced by the caching service and its expiry sweep,
/// not by the store. The options here only bound memory use.
///
/// ```
/// use std::time::Duration;
///
/// use kpicache_memory::InMemoryStore;
///
/// let store = InMemoryStore::<f64>::builder()
///     .max_capacity(10_000)
///     .max_lifetime(Duration::from_secs(3600))
///     .name("kpi-memory")
///     .build();
/// # let _ = store;
/// ```
#[derive(Debug)]
pub struct InMemoryStoreBuilder<V> {
    pub(crate) max_capacity: Option<u64>,
    pub(crate) max_lifetime: Option<Duration>,
    pub(crate) name: Option<String>,
    _value: PhantomData<V>,
}

impl<V> Default for InMemoryStoreBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> InMemoryStoreBuilder<V> {
    /// An unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_capacity: None,
            max_lifetime: None,
            name: None,
            _value: PhantomData,
        }
    }

    /// Caps the number of entries. Beyond it moka evicts by `TinyLFU`.
    #[must_use]
    pub fn max_capacity(mut self, entries: u64) -> Self {
        self.max_capacity = Some(entries);
        self
    }

    /// Drops any entry this long after it was written, whatever its TTL.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Names the underlying moka cache.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the store.
    #[must_use]
    pub fn build(self) -> InMemoryStore<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        InMemoryStore::from_builder(&self)
    }
}
