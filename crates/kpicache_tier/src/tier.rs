// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The core trait for cache storage backends.

use std::time::SystemTime;

use crate::{CacheEntry, KeyFilter, Result};

/// Trait for cache storage backends.
///
/// Stores address entries by string key. Every operation is fallible so a
/// remote backend can report that it is unreachable; the caching service
/// decides whether such a failure is surfaced or absorbed.
///
/// All async methods are required. Only `len` has a default implementation,
/// returning `None` for stores that don't track size.
///
/// # Versioning
///
/// Writes are ordered by [`CacheEntry::version`]:
///
/// - `insert` leaves an existing entry in place when its version is higher than
///   the incoming one.
/// - `compare_and_insert` writes only when the stored version equals `expected`.
#[cfg_attr(
    feature = "dynamic-store",
    dynosaur::dynosaur(pub(crate) DynEntryStore = dyn(box) EntryStore, bridge(none))
)]
pub trait EntryStore<V>: Send + Sync {
    /// Gets an entry.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry<V>>>> + Send;

    /// Inserts an entry unless the stored entry has a higher version.
    ///
    /// Returns `true` if the entry was written.
    fn insert(&self, key: &str, entry: CacheEntry<V>) -> impl Future<Output = Result<bool>> + Send;

    /// Inserts an entry only if the stored version equals `expected`.
    ///
    /// Returns `true` if the entry was written. A missing entry never matches.
    fn compare_and_insert(&self, key: &str, expected: u64, entry: CacheEntry<V>) -> impl Future<Output = Result<bool>> + Send;

    /// Removes an entry.
    fn invalidate(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes all entries.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    /// Lists the keys selected by `filter`.
    fn keys(&self, filter: &KeyFilter) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Removes every entry whose hard deadline is at or before `now` and returns their keys.
    fn evict_expired(&self, now: SystemTime) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Checks that the backend is reachable.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Returns the number of entries, if supported.
    fn len(&self) -> Option<u64> {
        None
    }

    /// Returns a short name used in logs and errors.
    fn name(&self) -> &'static str;
}
