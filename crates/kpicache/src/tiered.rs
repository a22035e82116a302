// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Composition of the in-process tier with an optional distributed tier.
//!
//! Memory is authoritative for the running process. The distributed tier is
//! consulted on memory misses and written asynchronously. Any sign that the
//! distributed tier is unreachable flips the store into degraded mode, where
//! distributed calls are skipped until a probe succeeds. Invalidations that
//! could not be delivered meanwhile are replayed before the flag clears.
//!
//! Distributed writes for one key are chained so they land in the order they
//! were made, and an invalidation waits for the key's pending writes before it
//! deletes, so a delayed write can never resurrect an invalidated entry.

use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use kpicache_tier::{CacheEntry, DynamicStore, EntryStore, KeyFilter, StoreError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    CacheError,
    stats::{StatKind, Stats},
    telemetry::{CacheActivity, CacheOperation, Telemetry},
};

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Memory,
    Distributed,
}

/// An invalidation that could not reach the distributed tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Missed {
    Key(String),
    Tag(String),
    Pattern(String),
}

pub(crate) struct TieredStore<V> {
    memory: DynamicStore<V>,
    distributed: Option<Arc<Distributed<V>>>,
}

impl<V> std::fmt::Debug for TieredStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("memory", &self.memory)
            .field("distributed", &self.distributed.as_ref().map(|d| &d.store))
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

pub(crate) struct Distributed<V> {
    store: DynamicStore<V>,
    degraded: AtomicBool,
    timeout: Duration,
    missed: Mutex<HashSet<Missed>>,
    writes: Mutex<HashMap<String, JoinHandle<()>>>,
    stats: Arc<Stats>,
    telemetry: Telemetry,
}

impl<V> TieredStore<V> {
    pub fn memory(&self) -> &DynamicStore<V> {
        &self.memory
    }

    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.distributed.as_ref().is_some_and(|d| d.degraded.load(Ordering::Acquire))
    }

    /// Returns how many invalidations wait to be replayed on the distributed tier.
    pub fn pending_missed(&self) -> usize {
        self.distributed.as_ref().map_or(0, |d| d.missed.lock().len())
    }
}

impl<V> TieredStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(memory: DynamicStore<V>) -> Self {
        Self { memory, distributed: None }
    }

    pub fn with_distributed(mut self, store: DynamicStore<V>, timeout: Duration, stats: Arc<Stats>, telemetry: Telemetry) -> Self {
        self.distributed = Some(Arc::new(Distributed {
            store,
            degraded: AtomicBool::new(false),
            timeout,
            missed: Mutex::new(HashSet::new()),
            writes: Mutex::new(HashMap::new()),
            stats,
            telemetry,
        }));
        self
    }

    /// Reads memory first, then the distributed tier.
    ///
    /// Distributed failures are absorbed and reported as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<(CacheEntry<V>, Source)>, CacheError> {
        if let Some(entry) = self.memory.get(key).await? {
            return Ok(Some((entry, Source::Memory)));
        }

        let Some(distributed) = &self.distributed else {
            return Ok(None);
        };
        Ok(distributed
            .call(key, distributed.store.get(key))
            .await
            .flatten()
            .map(|entry| (entry, Source::Distributed)))
    }

    /// Copies an entry read from the distributed tier into memory.
    pub async fn promote(&self, key: &str, entry: CacheEntry<V>) -> Result<bool, CacheError> {
        Ok(self.memory.insert(key, entry).await?)
    }

    /// Writes to memory, then schedules a best-effort distributed write.
    pub async fn write(&self, key: &str, entry: CacheEntry<V>) -> Result<bool, CacheError> {
        let written = self.memory.insert(key, entry.clone()).await?;
        if written {
            self.replicate(key, entry);
        }
        Ok(written)
    }

    /// Writes only if memory still holds version `expected`.
    pub async fn compare_and_write(&self, key: &str, expected: u64, entry: CacheEntry<V>) -> Result<bool, CacheError> {
        let written = self.memory.compare_and_insert(key, expected, entry.clone()).await?;
        if written {
            self.replicate(key, entry);
        }
        Ok(written)
    }

    /// Removes `key` from both tiers.
    ///
    /// Pending distributed writes for the key finish before the distributed
    /// delete is issued, and memory is cleared last.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        if let Some(distributed) = &self.distributed {
            distributed.settle(key).await;
            distributed
                .deliver(key, Missed::Key(key.to_owned()), distributed.store.invalidate(key))
                .await;
        }
        self.memory.invalidate(key).await?;
        Ok(())
    }

    /// Lists distributed keys under `tag`, remembering the tag if the tier cannot answer.
    pub async fn distributed_tag_keys(&self, tag: &str) -> Vec<String> {
        let Some(distributed) = &self.distributed else {
            return Vec::new();
        };
        let filter = KeyFilter::tag(tag);
        distributed
            .deliver(tag, Missed::Tag(tag.to_owned()), distributed.store.keys(&filter))
            .await
            .unwrap_or_default()
    }

    /// Lists distributed keys matching `filter`, remembering the pattern if the tier cannot answer.
    pub async fn distributed_pattern_keys(&self, glob: &str, filter: &KeyFilter) -> Vec<String> {
        let Some(distributed) = &self.distributed else {
            return Vec::new();
        };
        distributed
            .deliver(glob, Missed::Pattern(glob.to_owned()), distributed.store.keys(filter))
            .await
            .unwrap_or_default()
    }

    pub async fn evict_expired(&self, now: SystemTime) -> Result<Vec<String>, CacheError> {
        Ok(self.memory.evict_expired(now).await?)
    }

    /// Pings the distributed tier if it is degraded and clears the flag on success.
    ///
    /// Returns true if the tier recovered during this call.
    pub async fn probe(&self) -> bool {
        match &self.distributed {
            Some(distributed) if distributed.degraded.load(Ordering::Acquire) => distributed.probe().await,
            _ => false,
        }
    }

    /// Waits for every scheduled distributed write to finish.
    pub async fn flush(&self) {
        if let Some(distributed) = &self.distributed {
            distributed.flush().await;
        }
    }

    fn replicate(&self, key: &str, entry: CacheEntry<V>) {
        if let Some(distributed) = &self.distributed {
            Distributed::spawn_write(distributed, key.to_owned(), entry);
        }
    }
}

impl<V> Distributed<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Runs a distributed call unless degraded. Failures are absorbed.
    async fn call<T>(&self, key: &str, fut: impl Future<Output = kpicache_tier::Result<T>>) -> Option<T> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) if e.is_unavailable() => {
                self.degrade(key, &e);
                None
            }
            Ok(Err(e)) => {
                self.stats.record(StatKind::Error, None, None);
                self.telemetry.record(CacheOperation::Get, CacheActivity::Error, key, None);
                tracing::debug!(error = %e, key, "distributed store call failed");
                None
            }
            Err(_) => {
                let e = StoreError::unavailable(self.store.name(), format!("no response within {:?}", self.timeout));
                self.degrade(key, &e);
                None
            }
        }
    }

    /// Like [`call`](Self::call), but remembers `missed` when the call did not go through.
    async fn deliver<T>(&self, key: &str, missed: Missed, fut: impl Future<Output = kpicache_tier::Result<T>>) -> Option<T> {
        let result = self.call(key, fut).await;
        if result.is_none() && self.degraded.load(Ordering::Acquire) {
            self.missed.lock().insert(missed);
        }
        result
    }

    fn degrade(&self, key: &str, error: &StoreError) {
        self.stats.record(StatKind::Error, None, None);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(error = %error, "distributed store unreachable, serving from memory only");
            self.telemetry.record(CacheOperation::Get, CacheActivity::Degraded, key, None);
        }
    }

    /// Spawns the distributed write of `entry`, queued behind any write of the same key.
    fn spawn_write(this: &Arc<Self>, key: String, entry: CacheEntry<V>) {
        let distributed = Arc::clone(this);
        let mut writes = this.writes.lock();
        writes.retain(|_, write| !write.is_finished());
        let previous = writes.remove(&key);
        let owned = key.clone();
        let write = tokio::spawn(async move {
            if let Some(previous) = previous {
                await_write(&owned, previous).await;
            }
            let written = distributed
                .deliver(&owned, Missed::Key(owned.clone()), distributed.store.insert(&owned, entry))
                .await;
            if written.is_none() {
                tracing::debug!(key = owned.as_str(), "distributed write skipped");
            }
        });
        writes.insert(key, write);
    }

    /// Waits until no write of `key` is pending.
    async fn settle(&self, key: &str) {
        let pending = self.writes.lock().remove(key);
        if let Some(write) = pending {
            await_write(key, write).await;
        }
    }

    async fn probe(&self) -> bool {
        let pinged = tokio::time::timeout(self.timeout, self.store.ping()).await;
        if !matches!(pinged, Ok(Ok(()))) {
            tracing::debug!(store = self.store.name(), "distributed store still unreachable");
            return false;
        }

        if !self.replay().await {
            return false;
        }

        self.degraded.store(false, Ordering::Release);
        tracing::info!(store = self.store.name(), "distributed store reachable again");
        self.telemetry.record(CacheOperation::Probe, CacheActivity::Recovered, "", None);
        true
    }

    /// Delivers remembered invalidations. Undelivered ones are kept for the next probe.
    async fn replay(&self) -> bool {
        let missed: Vec<Missed> = mem::take(&mut *self.missed.lock()).into_iter().collect();
        let mut remaining = Vec::new();
        let mut failed = false;

        for item in missed {
            if failed {
                remaining.push(item);
                continue;
            }
            if self.replay_one(&item).await.is_err() {
                failed = true;
                remaining.push(item);
            }
        }

        if failed {
            self.missed.lock().extend(remaining);
        }
        !failed
    }

    async fn replay_one(&self, item: &Missed) -> kpicache_tier::Result<()> {
        let keys = match item {
            Missed::Key(key) => vec![key.clone()],
            Missed::Tag(tag) => self.bounded(self.store.keys(&KeyFilter::tag(tag.as_str()))).await?,
            Missed::Pattern(glob) => self.bounded(self.store.keys(&KeyFilter::pattern(glob)?)).await?,
        };
        for key in keys {
            self.bounded(self.store.invalidate(&key)).await?;
        }
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = kpicache_tier::Result<T>>) -> kpicache_tier::Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or_else(|_| Err(StoreError::unavailable(self.store.name(), "probe replay timed out")))
    }

    async fn flush(&self) {
        let writes = mem::take(&mut *self.writes.lock());
        for (key, write) in writes {
            await_write(&key, write).await;
        }
    }
}

async fn await_write(key: &str, write: JoinHandle<()>) {
    if let Err(e) = write.await {
        tracing::debug!(key, error = %e, "distributed write did not complete");
    }
}
