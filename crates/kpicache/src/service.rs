// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The caching service.

use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, UNIX_EPOCH},
};

use kpicache_tier::{CacheEntry, Clock, EntryState, EntryStore, ExpiryPolicy, GlobPattern, KeyFilter};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{
    runtime::Handle,
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    CacheConfig, CacheError, EventMappingTable, KeyBuilder, Loader, LoadOptions, Lookup,
    bridge::InvalidationBridge,
    builder::CacheServiceBuilder,
    flight::SingleFlight,
    health::{Backend, Health},
    locks::KeyLocks,
    refresh::RefreshTracker,
    stats::{StatKind, Stats, StatsSnapshot},
    tags::TagIndex,
    telemetry::{CacheActivity, CacheOperation, Telemetry, timed},
    tiered::{Source, TieredStore},
    warmer::Warmer,
};

/// A KPI cache: tiered storage with tag and pattern invalidation,
/// single-flight loading, stale-while-revalidate and scheduled warming.
///
/// `CacheService` is a cheap handle; clones share one cache.
///
/// # Examples
///
/// ```
/// use kpicache::{CacheConfig, CacheService, LoadOptions, Loader};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = CacheService::<u64>::init(CacheConfig::default())?;
///
/// let key = cache.keys().build("leads_total", [("dealership_id", 42)])?;
/// let options = LoadOptions::new().tag("kpi").tag("dealership_42");
/// let lookup = cache
///     .get_or_load(&key, options, Loader::new(|| async { Ok::<_, std::io::Error>(17) }))
///     .await?;
/// assert_eq!(lookup.value, 17);
///
/// assert_eq!(cache.invalidate_tag("dealership_42").await?, 1);
/// assert!(cache.get(&key).await?.is_none());
/// # Ok(())
/// # }
/// ```
pub struct CacheService<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheService<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for CacheService<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("name", &self.inner.telemetry.name())
            .field("tiered", &self.inner.tiered)
            .field("tagged_keys", &self.inner.index.key_count())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Registered<V> {
    loader: Loader<V>,
    options: LoadOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoadMode {
    /// Load on a miss, unless a concurrent caller already filled the key.
    Fill,
    /// Load and overwrite unconditionally.
    Force,
    /// Replace the entry only if it still carries `expected`.
    Refresh { expected: u64 },
}

struct Inner<V> {
    config: CacheConfig,
    policy: ExpiryPolicy,
    clock: Clock,
    runtime: Handle,
    keys: KeyBuilder,
    tiered: TieredStore<V>,
    index: TagIndex,
    locks: KeyLocks,
    flight: SingleFlight<CacheEntry<V>>,
    refresh: RefreshTracker,
    warmer: Warmer,
    loaders: RwLock<HashMap<String, Registered<V>>>,
    groups: RwLock<HashMap<String, String>>,
    stats: Arc<Stats>,
    bridge: InvalidationBridge,
    telemetry: Telemetry,
    versions: AtomicU64,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Parts assembled by [`CacheServiceBuilder`].
pub(crate) struct Parts<V> {
    pub config: CacheConfig,
    pub clock: Clock,
    pub runtime: Handle,
    pub tiered: TieredStore<V>,
    pub stats: Arc<Stats>,
    pub table: EventMappingTable,
    pub telemetry: Telemetry,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.warmer.shutdown();
        self.refresh.shutdown();
    }
}

impl<V> CacheService<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Starts building a service from `config`.
    #[must_use]
    pub fn builder(config: CacheConfig) -> CacheServiceBuilder<V> {
        CacheServiceBuilder::new(config)
    }

    /// Creates a memory-only service.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or no Tokio runtime is running.
    pub fn init(config: CacheConfig) -> Result<Self, crate::ConfigError> {
        Self::builder(config).build()
    }

    pub(crate) fn from_parts(parts: Parts<V>) -> Self {
        let Parts {
            config,
            clock,
            runtime,
            tiered,
            stats,
            table,
            telemetry,
        } = parts;

        // Seeded from the wall clock so versions keep growing across restarts.
        let seed = clock
            .now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_micros()).unwrap_or(u64::MAX / 2));

        let inner = Arc::new(Inner {
            policy: config.expiry_policy(),
            keys: KeyBuilder::new(config.key_prefix.clone()).max_params_len(config.max_params_len),
            clock,
            runtime,
            tiered,
            index: TagIndex::new(),
            locks: KeyLocks::new(),
            flight: SingleFlight::new(),
            refresh: RefreshTracker::new(),
            warmer: Warmer::new(),
            loaders: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            stats,
            bridge: InvalidationBridge::new(table),
            telemetry,
            versions: AtomicU64::new(seed),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let mut tasks = Vec::new();
        if inner.tiered.has_distributed() {
            tasks.push(spawn_periodic(&inner, inner.config.probe_interval(), |inner| async move {
                inner.tiered.probe().await;
            }));
        }
        tasks.push(spawn_periodic(&inner, inner.config.sweep_interval(), |inner| async move {
            inner.sweep().await;
        }));
        *inner.tasks.lock() = tasks;

        tracing::info!(
            cache = inner.telemetry.name(),
            distributed = inner.tiered.has_distributed(),
            "cache service started"
        );
        Self { inner }
    }

    /// Returns the configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the key builder configured with this service's prefix.
    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.inner.keys
    }

    /// Builds a key with this service's prefix. See [`KeyBuilder::build`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] for a malformed namespace or parameter name.
    pub fn key<I, K, P>(&self, namespace: &str, params: I) -> Result<String, CacheError>
    where
        I: IntoIterator<Item = (K, P)>,
        K: AsRef<str>,
        P: Display,
    {
        self.inner.keys.build(namespace, params)
    }

    /// Looks up `key`.
    ///
    /// A fresh entry is returned as is. A stale entry is returned flagged
    /// stale, and a background refresh is scheduled if a loader is registered
    /// for the key. An expired or missing entry is loaded through the
    /// registered loader, or reported as absent when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if memory cannot be read or the registered loader fails.
    pub async fn get(&self, key: &str) -> Result<Option<Lookup<V>>, CacheError> {
        let start = Instant::now();
        let inner = &self.inner;
        let group = inner.group_of(key);

        let entry = match inner.lookup(key).await {
            Ok(entry) => entry,
            Err(e) => {
                inner.fail(CacheOperation::Get, key, group.as_deref());
                return Err(e);
            }
        };

        let now = inner.clock.now();
        let registered = inner.loaders.read().get(key).cloned();
        match entry.map(|entry| (entry.state_at(now), entry)) {
            Some((EntryState::Fresh, entry)) => {
                inner.served(StatKind::Hit, CacheOperation::Get, key, group.as_deref(), start);
                Ok(Some(Lookup::fresh(entry.into_value())))
            }
            Some((EntryState::Stale, entry)) => {
                if let Some(registered) = registered {
                    inner.schedule_refresh(key, registered.loader, registered.options, entry.version());
                }
                inner.served(StatKind::StaleHit, CacheOperation::Get, key, group.as_deref(), start);
                Ok(Some(Lookup::stale(entry.into_value())))
            }
            expired_or_missing => {
                if expired_or_missing.is_some() {
                    inner.telemetry.record(CacheOperation::Get, CacheActivity::Expired, key, None);
                }
                inner.served(StatKind::Miss, CacheOperation::Get, key, group.as_deref(), start);
                let Some(registered) = registered else {
                    return Ok(None);
                };
                let entry = inner.load(key, registered.loader, registered.options, LoadMode::Fill).await?;
                Ok(Some(Lookup::fresh(entry.into_value())))
            }
        }
    }

    /// Returns the cached value for `key`, loading it with `loader` when absent
    /// or expired.
    ///
    /// Concurrent callers for the same key share one invocation of the loader.
    /// A stale value is returned immediately while `loader` refreshes it in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Factory`], [`CacheError::Timeout`] or
    /// [`CacheError::FactoryPanicked`] when the load fails; nothing is cached
    /// in that case.
    pub async fn get_or_load(&self, key: &str, options: LoadOptions, loader: Loader<V>) -> Result<Lookup<V>, CacheError> {
        let start = Instant::now();
        let inner = &self.inner;
        if let Some(group) = options.group_name() {
            inner.groups.write().insert(key.to_owned(), group.to_owned());
        }
        let group = options.group_name();

        let entry = match inner.lookup(key).await {
            Ok(entry) => entry,
            Err(e) => {
                inner.fail(CacheOperation::GetOrLoad, key, group);
                return Err(e);
            }
        };

        let now = inner.clock.now();
        match entry.map(|entry| (entry.state_at(now), entry)) {
            Some((EntryState::Fresh, entry)) => {
                inner.served(StatKind::Hit, CacheOperation::GetOrLoad, key, group, start);
                Ok(Lookup::fresh(entry.into_value()))
            }
            Some((EntryState::Stale, entry)) => {
                inner.schedule_refresh(key, loader, options.clone(), entry.version());
                inner.served(StatKind::StaleHit, CacheOperation::GetOrLoad, key, group, start);
                Ok(Lookup::stale(entry.into_value()))
            }
            expired_or_missing => {
                if expired_or_missing.is_some() {
                    inner.telemetry.record(CacheOperation::GetOrLoad, CacheActivity::Expired, key, None);
                }
                inner.served(StatKind::Miss, CacheOperation::GetOrLoad, key, group, start);
                let entry = inner.load(key, loader, options.clone(), LoadMode::Fill).await?;
                Ok(Lookup::fresh(entry.into_value()))
            }
        }
    }

    /// Stores `value` under `key`.
    ///
    /// `ttl` overrides the configured default. The key is indexed under every
    /// tag in `tags`, replacing any tags it had before.
    ///
    /// # Errors
    ///
    /// Returns an error if memory rejects the write.
    pub async fn set<I, T>(&self, key: &str, value: V, ttl: Option<Duration>, tags: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut options = LoadOptions::new().tags(tags);
        if let Some(ttl) = ttl {
            options = options.ttl(ttl);
        }
        let entry = self.inner.make_entry(value, &options);
        let group = self.inner.group_of(key);
        self.inner.store(key, entry, group.as_deref(), CacheOperation::Set, None).await
    }

    /// Removes `key` from every tier and from the tag index.
    ///
    /// A pending background refresh of the key is cancelled. If its loader has
    /// already started, the loader runs to completion but its result is
    /// discarded, because the entry it would replace is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if memory cannot be updated.
    pub async fn invalidate_key(&self, key: &str) -> Result<(), CacheError> {
        self.inner.evict(&BTreeSet::from([key.to_owned()])).await
    }

    /// Removes every key carrying `tag`. Returns how many keys were invalidated.
    ///
    /// Keys are gathered from the local index and, when reachable, from the
    /// distributed tier.
    ///
    /// # Errors
    ///
    /// Returns an error if memory cannot be updated.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let inner = &self.inner;
        let mut keys: BTreeSet<String> = inner.index.keys_for_tag(tag).into_iter().collect();
        keys.extend(inner.tiered.distributed_tag_keys(tag).await);

        inner.evict(&keys).await?;
        tracing::debug!(cache = inner.telemetry.name(), tag, keys = keys.len(), "tag invalidated");
        Ok(keys.len())
    }

    /// Removes every key matching the glob `pattern`, and every key indexed
    /// under a tag matching it. Returns how many keys were invalidated.
    ///
    /// `*` matches any run of characters and `?` any single character.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidPattern`] for an empty pattern, or an
    /// error if memory cannot be scanned or updated.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let inner = &self.inner;
        let glob = GlobPattern::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: e.message().to_owned(),
        })?;
        let filter = KeyFilter::Pattern(glob.clone());

        let mut keys: BTreeSet<String> = inner.index.keys_matching(|key| glob.is_match(key)).into_iter().collect();
        keys.extend(inner.tiered.memory().keys(&filter).await?);
        keys.extend(inner.tiered.distributed_pattern_keys(pattern, &filter).await);

        let tags = inner.index.tags_matching(|tag| glob.is_match(tag));
        for tag in &tags {
            keys.extend(inner.index.keys_for_tag(tag));
            keys.extend(inner.tiered.distributed_tag_keys(tag).await);
        }

        inner.evict(&keys).await?;
        tracing::debug!(
            cache = inner.telemetry.name(),
            pattern,
            keys = keys.len(),
            tags = tags.len(),
            "pattern invalidated"
        );
        Ok(keys.len())
    }

    /// Translates a domain event into tag invalidations.
    ///
    /// Failures are logged and counted but never returned. Returns the tags
    /// that were invalidated.
    pub async fn on_event(&self, source: &str, event_type: &str, attributes: &Value) -> Vec<String> {
        let inner = &self.inner;
        let mut invalidated = Vec::new();
        for tag in inner.bridge.tags_for(source, event_type, attributes) {
            match self.invalidate_tag(&tag).await {
                Ok(keys) => {
                    tracing::info!(cache = inner.telemetry.name(), source, event_type, tag = tag.as_str(), keys, "event invalidated tag");
                    invalidated.push(tag);
                }
                Err(e) => {
                    tracing::warn!(cache = inner.telemetry.name(), source, event_type, tag = tag.as_str(), error = %e, "event invalidation failed");
                    inner.fail(CacheOperation::Event, &tag, None);
                }
            }
        }
        invalidated
    }

    /// Replaces the event mapping table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not validate; the current table is kept.
    pub fn set_event_table(&self, table: EventMappingTable) -> Result<(), crate::ConfigError> {
        table.validate()?;
        self.inner.bridge.replace(table);
        Ok(())
    }

    /// Returns a copy of the active event mapping table.
    #[must_use]
    pub fn event_table(&self) -> EventMappingTable {
        self.inner.bridge.table()
    }

    /// Registers `loader` for `key`, letting plain [`get`](Self::get) calls
    /// load and refresh the key.
    pub fn register_loader(&self, key: &str, options: LoadOptions, loader: Loader<V>) {
        self.inner
            .loaders
            .write()
            .insert(key.to_owned(), Registered { loader, options });
    }

    /// Forgets the loader for `key`. Returns true if one was registered.
    pub fn unregister_loader(&self, key: &str) -> bool {
        self.inner.loaders.write().remove(key).is_some()
    }

    /// Loads `key` now and then every `interval`, keeping it hot.
    ///
    /// The loader is also registered for the key. A failing tick is logged and
    /// counted and the schedule keeps running. Warming a key again replaces its
    /// schedule.
    pub fn warm(&self, key: &str, options: LoadOptions, loader: Loader<V>, interval: Duration) {
        self.register_loader(key, options.clone(), loader.clone());

        let weak = Arc::downgrade(&self.inner);
        let owned = key.to_owned();
        let _runtime = self.inner.runtime.enter();
        self.inner.warmer.schedule(key, interval, move || {
            let weak = Weak::clone(&weak);
            let key = owned.clone();
            let loader = loader.clone();
            let options = options.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                if let Err(e) = inner.load(&key, loader, options, LoadMode::Force).await {
                    tracing::warn!(cache = inner.telemetry.name(), key = key.as_str(), error = %e, "warm-up failed");
                }
                true
            }
        });
        tracing::debug!(cache = self.inner.telemetry.name(), key, ?interval, "warm-up scheduled");
    }

    /// Stops warming `key` and forgets its loader. Returns true if it was warmed.
    pub fn unwarm(&self, key: &str) -> bool {
        self.unregister_loader(key);
        self.inner.warmer.unschedule(key)
    }

    /// Returns the keys currently warmed, sorted.
    #[must_use]
    pub fn warmed_keys(&self) -> Vec<String> {
        self.inner.warmer.keys()
    }

    /// Returns the keys indexed under `tag`, sorted.
    #[must_use]
    pub fn tagged_keys(&self, tag: &str) -> Vec<String> {
        self.inner.index.keys_for_tag(tag)
    }

    /// Returns the tags `key` is indexed under, sorted.
    #[must_use]
    pub fn key_tags(&self, key: &str) -> Vec<String> {
        self.inner.index.tags_for_key(key)
    }

    /// Reports the active backend and whether it is degraded.
    #[must_use]
    pub fn health_check(&self) -> Health {
        let tiered = &self.inner.tiered;
        Health {
            backend: if tiered.has_distributed() {
                Backend::Distributed
            } else {
                Backend::Memory
            },
            degraded: tiered.is_degraded(),
        }
    }

    /// Returns the global counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Returns the counters of one KPI group, if it has recorded anything.
    #[must_use]
    pub fn group_stats(&self, group: &str) -> Option<StatsSnapshot> {
        self.inner.stats.group(group)
    }

    /// Returns the names of every group with counters, sorted.
    #[must_use]
    pub fn stat_groups(&self) -> Vec<String> {
        self.inner.stats.groups()
    }

    /// Zeroes every counter.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Returns how many background refreshes are in flight.
    #[must_use]
    pub fn pending_refreshes(&self) -> usize {
        self.inner.refresh.pending()
    }

    /// Returns true if a background refresh for `key` is in flight.
    #[must_use]
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.inner.refresh.is_refreshing(key)
    }

    /// Probes a degraded distributed tier now instead of waiting for the
    /// next scheduled probe. Returns true if it recovered.
    pub async fn probe(&self) -> bool {
        self.inner.tiered.probe().await
    }

    /// Drops expired entries from memory now. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if memory cannot be scanned.
    pub async fn evict_expired(&self) -> Result<usize, CacheError> {
        self.inner.evict_expired().await.map(|keys| keys.len())
    }

    /// Waits for pending distributed writes to finish.
    pub async fn flush(&self) {
        self.inner.tiered.flush().await;
    }

    /// Stops warming, refreshes, in-flight loads and background tasks, then
    /// waits for pending distributed writes.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.warmer.shutdown();
        inner.refresh.shutdown();
        inner.flight.abort_all();
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        inner.tiered.flush().await;
        tracing::info!(cache = inner.telemetry.name(), "cache service stopped");
    }
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn group_of(&self, key: &str) -> Option<String> {
        let registered = self
            .loaders
            .read()
            .get(key)
            .and_then(|registered| registered.options.group_name().map(str::to_owned));
        registered.or_else(|| self.groups.read().get(key).cloned())
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn make_entry(&self, value: V, options: &LoadOptions) -> CacheEntry<V> {
        let policy = options.ttl_override().map_or(self.policy, |ttl| self.policy.with_ttl(ttl));
        CacheEntry::new(value, self.clock.now(), policy)
            .with_tags(options.tags_list().iter().cloned())
            .with_version(self.next_version())
    }

    fn served(&self, kind: StatKind, operation: CacheOperation, key: &str, group: Option<&str>, start: Instant) {
        let elapsed = start.elapsed();
        self.stats.record(kind, group, Some(elapsed));
        let activity = match kind {
            StatKind::Hit => CacheActivity::Hit,
            StatKind::StaleHit => CacheActivity::StaleHit,
            _ => CacheActivity::Miss,
        };
        self.telemetry.record(operation, activity, key, Some(elapsed));
    }

    fn fail(&self, operation: CacheOperation, key: &str, group: Option<&str>) {
        self.stats.record(StatKind::Error, group, None);
        self.telemetry.record(operation, CacheActivity::Error, key, None);
    }

    /// Reads through both tiers, promoting live distributed entries into memory.
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry<V>>, CacheError> {
        let slot = self.locks.slot(key);
        let evictions = slot.evictions();
        let Some((entry, source)) = self.tiered.get(key).await? else {
            return Ok(None);
        };
        if source == Source::Memory {
            return Ok(Some(entry));
        }
        if entry.state_at(self.clock.now()) == EntryState::Expired {
            return Ok(None);
        }

        let _guard = slot.lock().await;
        if slot.evictions() != evictions {
            // Invalidated after the distributed read; the copy is gone from every tier.
            return Ok(None);
        }
        self.versions.fetch_max(entry.version(), Ordering::AcqRel);
        self.index.register(key, entry.tags().iter().cloned());
        if self.tiered.promote(key, entry.clone()).await? {
            self.telemetry.record(CacheOperation::Get, CacheActivity::Promoted, key, None);
        } else {
            self.reconcile_index(key).await;
        }
        Ok(Some(entry))
    }

    /// Makes the index agree with what memory holds for `key`.
    ///
    /// Returns false if memory no longer holds the key. Call with the key's lock held.
    async fn reconcile_index(&self, key: &str) -> bool {
        match self.tiered.memory().get(key).await {
            Ok(Some(entry)) => {
                self.index.register(key, entry.tags().iter().cloned());
                true
            }
            Ok(None) => {
                self.index.remove_key(key);
                false
            }
            Err(e) => {
                tracing::warn!(cache = self.telemetry.name(), key, error = %e, "could not reconcile tag index");
                true
            }
        }
    }

    /// Indexes and writes `entry` under the key's lock.
    async fn store(
        &self,
        key: &str,
        entry: CacheEntry<V>,
        group: Option<&str>,
        operation: CacheOperation,
        duration: Option<Duration>,
    ) -> Result<(), CacheError> {
        let slot = self.locks.slot(key);
        let _guard = slot.lock().await;
        self.index.register(key, entry.tags().iter().cloned());
        match self.tiered.write(key, entry).await {
            Ok(true) => {
                self.stats.record(StatKind::Set, group, None);
                self.telemetry.record(operation, CacheActivity::Inserted, key, duration);
                Ok(())
            }
            Ok(false) => {
                self.reconcile_index(key).await;
                Ok(())
            }
            Err(e) => {
                self.reconcile_index(key).await;
                self.fail(operation, key, group);
                Err(e)
            }
        }
    }

    /// Loads `key` through the single-flight table.
    async fn load(
        self: &Arc<Self>,
        key: &str,
        loader: Loader<V>,
        options: LoadOptions,
        mode: LoadMode,
    ) -> Result<CacheEntry<V>, CacheError> {
        let inner = Arc::clone(self);
        let owned = key.to_owned();
        let resolved = self
            .flight
            .resolve(key, move || inner.run_load(owned, loader, options, mode))
            .await;

        if resolved.joined {
            self.stats.record(StatKind::Coalesced, self.group_of(key).as_deref(), None);
            self.telemetry.record(CacheOperation::Load, CacheActivity::Coalesced, key, None);
        }
        resolved.result
    }

    async fn run_load(
        self: Arc<Self>,
        key: String,
        loader: Loader<V>,
        options: LoadOptions,
        mode: LoadMode,
    ) -> Result<CacheEntry<V>, CacheError> {
        let group = options.group_name().map(str::to_owned).or_else(|| self.group_of(&key));
        let result = self.produce(&key, loader, &options, mode, group.as_deref()).await;
        if let Err(e) = &result {
            let operation = match mode {
                LoadMode::Refresh { .. } => CacheOperation::Refresh,
                LoadMode::Force => CacheOperation::Warm,
                LoadMode::Fill => CacheOperation::Load,
            };
            tracing::warn!(cache = self.telemetry.name(), key = key.as_str(), error = %e, "load failed");
            self.fail(operation, &key, group.as_deref());
        }
        result
    }

    async fn produce(
        &self,
        key: &str,
        loader: Loader<V>,
        options: &LoadOptions,
        mode: LoadMode,
        group: Option<&str>,
    ) -> Result<CacheEntry<V>, CacheError> {
        if mode == LoadMode::Fill {
            // A caller that just missed the previous flight may find the key filled.
            if let Some(entry) = self.tiered.memory().get(key).await? {
                if entry.state_at(self.clock.now()) == EntryState::Fresh {
                    return Ok(entry);
                }
            }
        }

        let limit = self.config.factory_timeout();
        let loaded = timed(tokio::time::timeout(limit, loader.load())).await;
        let value = match loaded.result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(CacheError::factory(e)),
            Err(_) => return Err(CacheError::Timeout(limit)),
        };

        let entry = self.make_entry(value, options);
        match mode {
            LoadMode::Refresh { expected } => {
                let slot = self.locks.slot(key);
                let _guard = slot.lock().await;
                self.index.register(key, entry.tags().iter().cloned());
                if self.tiered.compare_and_write(key, expected, entry.clone()).await? {
                    self.stats.record(StatKind::Refresh, group, None);
                    self.telemetry
                        .record(CacheOperation::Refresh, CacheActivity::Refreshed, key, Some(loaded.duration));
                } else {
                    self.reconcile_index(key).await;
                    self.telemetry
                        .record(CacheOperation::Refresh, CacheActivity::RefreshDiscarded, key, Some(loaded.duration));
                }
            }
            LoadMode::Fill | LoadMode::Force => {
                let operation = if mode == LoadMode::Force {
                    CacheOperation::Warm
                } else {
                    CacheOperation::Load
                };
                self.store(key, entry.clone(), group, operation, Some(loaded.duration)).await?;
            }
        }
        Ok(entry)
    }

    fn schedule_refresh(self: &Arc<Self>, key: &str, loader: Loader<V>, options: LoadOptions, expected: u64) {
        let inner = Arc::clone(self);
        let owned = key.to_owned();
        self.refresh.spawn_once(key, async move {
            if let Err(e) = inner.load(&owned, loader, options, LoadMode::Refresh { expected }).await {
                tracing::debug!(cache = inner.telemetry.name(), key = owned.as_str(), error = %e, "background refresh abandoned");
            }
        });
    }

    /// Removes `keys` from both tiers and from the index, one key lock at a time.
    ///
    /// A write that races the eviction of a key lands either before it and is
    /// removed, or after it and stays indexed. Tags left without keys disappear
    /// from the index with their last key.
    async fn evict(&self, keys: &BTreeSet<String>) -> Result<(), CacheError> {
        for key in keys {
            let slot = self.locks.slot(key);
            let _guard = slot.lock().await;
            slot.evicted();
            self.refresh.cancel(key);
            let group = self.group_of(key);
            if let Err(e) = self.tiered.invalidate(key).await {
                self.fail(CacheOperation::Invalidate, key, group.as_deref());
                return Err(e);
            }
            self.index.remove_key(key);
            self.groups.write().remove(key);
            self.stats.record(StatKind::Invalidation, group.as_deref(), None);
            self.telemetry.record(CacheOperation::Invalidate, CacheActivity::Invalidated, key, None);
        }
        Ok(())
    }

    async fn evict_expired(&self) -> Result<Vec<String>, CacheError> {
        let keys = self.tiered.evict_expired(self.clock.now()).await?;
        for key in &keys {
            let slot = self.locks.slot(key);
            let _guard = slot.lock().await;
            // The key may have been written again since it expired.
            if !self.reconcile_index(key).await {
                self.groups.write().remove(key);
            }
            self.telemetry.record(CacheOperation::Sweep, CacheActivity::Expired, key, None);
        }
        Ok(keys)
    }

    async fn sweep(&self) {
        match self.evict_expired().await {
            Ok(keys) if !keys.is_empty() => {
                tracing::debug!(cache = self.telemetry.name(), evicted = keys.len(), "expired entries swept");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(cache = self.telemetry.name(), error = %e, "sweep failed");
                self.fail(CacheOperation::Sweep, "*", None);
            }
        }
    }
}

/// Runs `job` every `period` for as long as the service is alive.
fn spawn_periodic<V, F, Fut>(inner: &Arc<Inner<V>>, period: Duration, job: F) -> AbortHandle
where
    V: Send + Sync + 'static,
    F: Fn(Arc<Inner<V>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(inner);
    inner
        .runtime
        .spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                job(inner).await;
            }
        })
        .abort_handle()
}
