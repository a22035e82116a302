// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock store implementation for testing.
//!
//! This module provides `MockStore`, an in-memory store that records all
//! operations and supports failure injection and offline simulation for
//! testing error paths and degraded mode.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use parking_lot::Mutex;

use crate::{CacheEntry, EntryStore, KeyFilter, Result, StoreError};

const NAME: &str = "mock";

/// Recorded store operation with full context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp<V> {
    /// A get for the key.
    Get(String),
    /// An insert of the entry under the key.
    Insert {
        /// The key that was written.
        key: String,
        /// The entry that was written.
        entry: CacheEntry<V>,
    },
    /// A versioned insert of the entry under the key.
    CompareAndInsert {
        /// The key that was written.
        key: String,
        /// The version the caller expected to replace.
        expected: u64,
        /// The entry that was written.
        entry: CacheEntry<V>,
    },
    /// An invalidation of the key.
    Invalidate(String),
    /// A clear of the whole store.
    Clear,
    /// A key listing.
    Keys,
    /// An expiry sweep.
    EvictExpired,
    /// A health probe.
    Ping,
}

type FailPredicate<V> = Box<dyn Fn(&StoreOp<V>) -> bool + Send + Sync>;

/// A configurable mock store for testing.
///
/// Values are kept in memory with the same version rules as real stores. All
/// operations are recorded. Individual operations can be failed with
/// [`fail_when`](Self::fail_when), and the whole store can be taken offline
/// with [`set_offline`](Self::set_offline), in which case every operation
/// returns an [`Unavailable`](crate::StoreErrorKind::Unavailable) error.
///
/// # Examples
///
/// ```no_run
/// use kpicache_tier::{testing::{MockStore, StoreOp}, CacheEntry, EntryStore, ExpiryPolicy};
/// use std::time::SystemTime;
///
/// # async fn example() {
/// let store = MockStore::<i32>::new();
/// let entry = CacheEntry::new(42, SystemTime::now(), ExpiryPolicy::default());
///
/// store.insert("key", entry).await.unwrap();
/// assert_eq!(*store.get("key").await.unwrap().unwrap().value(), 42);
///
/// store.set_offline(true);
/// assert!(store.get("key").await.unwrap_err().is_unavailable());
///
/// store.fail_when(|op| matches!(op, StoreOp::Get(k) if k == "forbidden"));
/// # }
/// ```
pub struct MockStore<V> {
    data: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
    operations: Arc<Mutex<Vec<StoreOp<V>>>>,
    fail_when: Arc<Mutex<Option<FailPredicate<V>>>>,
    offline: Arc<AtomicBool>,
}

impl<V: std::fmt::Debug> std::fmt::Debug for MockStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStore")
            .field("data", &self.data)
            .field("operations", &self.operations.lock().len())
            .field("fail_when", &self.fail_when.lock().is_some())
            .field("offline", &self.is_offline())
            .finish()
    }
}

impl<V> Clone for MockStore<V> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            operations: Arc::clone(&self.operations),
            fail_when: Arc::clone(&self.fail_when),
            offline: Arc::clone(&self.offline),
        }
    }
}

impl<V> Default for MockStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MockStore<V> {
    /// Creates a new empty, online mock store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            fail_when: Arc::new(Mutex::new(None)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulates losing or regaining the connection to the backend.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Returns true if the store is simulating an outage.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns true if the store holds the key.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// Sets a predicate that decides which operations fail with an operation error.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp<V>) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Clears all recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    fn check(&self, op: StoreOp<V>) -> Result<()> {
        let failed = if self.is_offline() {
            Some(StoreError::unavailable(NAME, "connection refused"))
        } else if self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(&op)) {
            Some(StoreError::operation(NAME, "injected failure"))
        } else {
            None
        };
        self.operations.lock().push(op);
        failed.map_or(Ok(()), Err)
    }
}

impl<V: Clone> MockStore<V> {
    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp<V>> {
        self.operations.lock().clone()
    }

    /// Returns the stored entry without recording an operation.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.data.lock().get(key).cloned()
    }
}

impl<V> EntryStore<V> for MockStore<V>
where
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        self.check(StoreOp::Get(key.to_owned()))?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn insert(&self, key: &str, entry: CacheEntry<V>) -> Result<bool> {
        self.check(StoreOp::Insert {
            key: key.to_owned(),
            entry: entry.clone(),
        })?;
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|existing| existing.version() > entry.version()) {
            return Ok(false);
        }
        data.insert(key.to_owned(), entry);
        Ok(true)
    }

    async fn compare_and_insert(&self, key: &str, expected: u64, entry: CacheEntry<V>) -> Result<bool> {
        self.check(StoreOp::CompareAndInsert {
            key: key.to_owned(),
            expected,
            entry: entry.clone(),
        })?;
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|existing| existing.version() == expected) {
            data.insert(key.to_owned(), entry);
            return Ok(true);
        }
        Ok(false)
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.check(StoreOp::Invalidate(key.to_owned()))?;
        self.data.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check(StoreOp::Clear)?;
        self.data.lock().clear();
        Ok(())
    }

    async fn keys(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        self.check(StoreOp::Keys)?;
        let mut keys: Vec<String> = self
            .data
            .lock()
            .iter()
            .filter(|(key, entry)| filter.matches(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn evict_expired(&self, now: SystemTime) -> Result<Vec<String>> {
        self.check(StoreOp::EvictExpired)?;
        let mut data = self.data.lock();
        let mut expired: Vec<String> = data
            .iter()
            .filter(|(_, entry)| entry.hard_expires_at() <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            data.remove(key);
        }
        expired.sort();
        Ok(expired)
    }

    async fn ping(&self) -> Result<()> {
        self.check(StoreOp::Ping)
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.lock().len() as u64)
    }

    fn name(&self) -> &'static str {
        NAME
    }
}
