// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for [`CacheService`].

use std::sync::Arc;

use kpicache_memory::InMemoryStore;
use kpicache_tier::{Clock, DynamicStore, DynamicStoreExt, EntryStore};
use tokio::runtime::Handle;

use crate::{
    CacheConfig, CacheService, ConfigError, EventMappingTable,
    service::Parts,
    stats::Stats,
    telemetry::Telemetry,
    tiered::TieredStore,
};

const DEFAULT_NAME: &str = "kpicache";

/// Configures and builds a [`CacheService`].
///
/// Created by [`CacheService::builder`]. Without further configuration the
/// service runs memory-only on a moka store sized by
/// [`CacheConfig::memory_max_capacity`], with the default event mapping table.
///
/// # Examples
///
/// ```
/// use kpicache::{CacheConfig, CacheService, EventMappingTable};
/// use kpicache_memory::InMemoryStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), kpicache::ConfigError> {
/// let cache = CacheService::<String>::builder(CacheConfig::default())
///     .name("dashboard")
///     .memory(InMemoryStore::with_capacity(1_000))
///     .event_table(EventMappingTable::default())
///     .build()?;
/// assert!(!cache.health_check().degraded);
/// # Ok(())
/// # }
/// ```
pub struct CacheServiceBuilder<V> {
    config: CacheConfig,
    name: &'static str,
    clock: Clock,
    memory: Option<DynamicStore<V>>,
    distributed: Option<DynamicStore<V>>,
    table: EventMappingTable,
}

impl<V> std::fmt::Debug for CacheServiceBuilder<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheServiceBuilder")
            .field("config", &self.config)
            .field("name", &self.name)
            .field("memory", &self.memory.is_some())
            .field("distributed", &self.distributed.is_some())
            .finish_non_exhaustive()
    }
}

impl<V> CacheServiceBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            config,
            name: DEFAULT_NAME,
            clock: Clock::system(),
            memory: None,
            distributed: None,
            table: EventMappingTable::default(),
        }
    }

    /// Sets the name reported in logs.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Replaces the default in-process store.
    #[must_use]
    pub fn memory<S>(mut self, store: S) -> Self
    where
        S: EntryStore<V> + 'static,
    {
        self.memory = Some(store.into_dynamic());
        self
    }

    /// Adds a distributed tier behind memory.
    #[must_use]
    pub fn distributed<S>(mut self, store: S) -> Self
    where
        S: EntryStore<V> + 'static,
    {
        self.distributed = Some(store.into_dynamic());
        self
    }

    /// Sets the table used by [`CacheService::on_event`].
    #[must_use]
    pub fn event_table(mut self, table: EventMappingTable) -> Self {
        self.table = table;
        self
    }

    /// Sets the clock entries are stamped with. Tests pass a controlled clock.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration and starts the service.
    ///
    /// Background probing and sweeping run on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or event table is invalid, or if
    /// called outside a Tokio runtime.
    pub fn build(self) -> Result<CacheService<V>, ConfigError> {
        self.config.validate()?;
        self.table.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let memory = self.memory.unwrap_or_else(|| {
            InMemoryStore::builder()
                .max_capacity(self.config.memory_max_capacity)
                .name(self.name)
                .build()
                .into_dynamic()
        });

        let stats = Arc::new(Stats::new(self.config.latency_threshold()));
        let telemetry = Telemetry::new(self.name);
        let mut tiered = TieredStore::new(memory);
        if let Some(distributed) = self.distributed {
            tiered = tiered.with_distributed(distributed, self.config.distributed_timeout(), Arc::clone(&stats), telemetry);
        }

        Ok(CacheService::from_parts(Parts {
            config: self.config,
            clock: self.clock,
            runtime,
            tiered,
            stats,
            table: self.table,
            telemetry,
        }))
    }
}
