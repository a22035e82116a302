// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    collections::BTreeSet,
    ops::Deref,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

/// Soft ratio applied when none is configured.
const DEFAULT_SOFT_RATIO: f64 = 0.8;

/// Time-to-live applied when none is configured.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Turns a TTL into a soft (stale) and hard (expired) deadline.
///
/// The soft deadline is `ttl * soft_ratio` after creation, the hard deadline is
/// `ttl` after creation. The ratio is clamped to `0.0..=1.0`, which keeps the soft
/// deadline at or before the hard one.
///
/// # Examples
///
/// ```
/// use kpicache_tier::ExpiryPolicy;
/// use std::time::Duration;
///
/// let policy = ExpiryPolicy::new(Duration::from_secs(30), 0.8);
/// assert_eq!(policy.soft_ttl(), Duration::from_secs(24));
/// assert_eq!(policy.ttl(), Duration::from_secs(30));
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExpiryPolicy {
    ttl: Duration,
    soft_ratio: f64,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SOFT_RATIO)
    }
}

impl ExpiryPolicy {
    /// Creates a policy from a TTL and the fraction of it during which entries are fresh.
    #[must_use]
    pub fn new(ttl: Duration, soft_ratio: f64) -> Self {
        let soft_ratio = if soft_ratio.is_nan() { 1.0 } else { soft_ratio.clamp(0.0, 1.0) };
        Self { ttl, soft_ratio }
    }

    /// Returns the same policy with a different TTL.
    #[must_use]
    pub fn with_ttl(self, ttl: Duration) -> Self {
        Self { ttl, ..self }
    }

    /// Returns the hard TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the fraction of the TTL during which entries are fresh.
    #[must_use]
    pub fn soft_ratio(&self) -> f64 {
        self.soft_ratio
    }

    /// Returns how long an entry stays fresh.
    #[must_use]
    pub fn soft_ttl(&self) -> Duration {
        self.ttl.mul_f64(self.soft_ratio)
    }

    /// Computes `(soft_expires_at, hard_expires_at)` for an entry created at `created_at`.
    #[must_use]
    pub fn deadlines(&self, created_at: SystemTime) -> (SystemTime, SystemTime) {
        (created_at + self.soft_ttl(), created_at + self.ttl)
    }
}

/// Freshness of an entry at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Before the soft deadline; served without side effects.
    Fresh,
    /// Between the soft and hard deadlines; served while a refresh runs.
    Stale,
    /// At or past the hard deadline; must be reloaded before use.
    Expired,
}

impl EntryState {
    /// Returns a stable lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        }
    }
}

/// A cached value with its expiry window, tags and write version.
///
/// Entries carry absolute wall-clock deadlines so that a value written by one
/// process can be read back from a distributed store by another. `version`
/// orders writes to the same key: stores never let a lower version replace a
/// higher one.
///
/// # Examples
///
/// ```
/// use kpicache_tier::{CacheEntry, EntryState, ExpiryPolicy};
/// use std::time::{Duration, SystemTime};
///
/// let now = SystemTime::now();
/// let entry = CacheEntry::new(42, now, ExpiryPolicy::new(Duration::from_secs(30), 0.8))
///     .with_tags(["dealership_1"])
///     .with_version(7);
///
/// assert_eq!(*entry.value(), 42);
/// assert_eq!(entry.version(), 7);
/// assert!(entry.has_tag("dealership_1"));
/// assert_eq!(entry.state_at(now + Duration::from_secs(25)), EntryState::Stale);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    value: V,
    created_at: SystemTime,
    soft_expires_at: SystemTime,
    hard_expires_at: SystemTime,
    #[serde(default)]
    tags: BTreeSet<String>,
    version: u64,
}

impl<V> CacheEntry<V> {
    /// Creates an untagged entry at version zero whose deadlines follow `policy`.
    pub fn new(value: V, created_at: SystemTime, policy: ExpiryPolicy) -> Self {
        let (soft_expires_at, hard_expires_at) = policy.deadlines(created_at);
        Self {
            value,
            created_at,
            soft_expires_at,
            hard_expires_at,
            tags: BTreeSet::new(),
            version: 0,
        }
    }

    /// Creates an entry from explicit deadlines.
    ///
    /// A soft deadline later than the hard deadline is pulled back to the hard one.
    pub fn from_parts(
        value: V,
        created_at: SystemTime,
        soft_expires_at: SystemTime,
        hard_expires_at: SystemTime,
        tags: BTreeSet<String>,
        version: u64,
    ) -> Self {
        Self {
            value,
            created_at,
            soft_expires_at: soft_expires_at.min(hard_expires_at),
            hard_expires_at,
            tags,
            version,
        }
    }

    /// Adds tags to the entry.
    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets the write version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Returns a reference to the cached value.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the entry and returns the inner value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns when the value was produced.
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the instant the entry turns stale.
    #[must_use]
    pub fn soft_expires_at(&self) -> SystemTime {
        self.soft_expires_at
    }

    /// Returns the instant the entry expires.
    #[must_use]
    pub fn hard_expires_at(&self) -> SystemTime {
        self.hard_expires_at
    }

    /// Returns the tags covering this entry.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns true if the entry carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the write version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Classifies the entry at `now`.
    #[must_use]
    pub fn state_at(&self, now: SystemTime) -> EntryState {
        if now >= self.hard_expires_at {
            EntryState::Expired
        } else if now >= self.soft_expires_at {
            EntryState::Stale
        } else {
            EntryState::Fresh
        }
    }

    /// Returns the time left before the hard deadline, or `None` once it has passed.
    #[must_use]
    pub fn remaining_ttl(&self, now: SystemTime) -> Option<Duration> {
        self.hard_expires_at.duration_since(now).ok().filter(|d| !d.is_zero())
    }
}

impl<V> Deref for CacheEntry<V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: SystemTime = SystemTime::UNIX_EPOCH;

    #[test]
    fn policy_clamps_ratio() {
        assert!((ExpiryPolicy::new(Duration::from_secs(1), 1.7).soft_ratio() - 1.0).abs() < f64::EPSILON);
        assert!(ExpiryPolicy::new(Duration::from_secs(1), -0.5).soft_ratio().abs() < f64::EPSILON);
        assert!((ExpiryPolicy::new(Duration::from_secs(1), f64::NAN).soft_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn state_transitions_follow_deadlines() {
        let entry = CacheEntry::new("v", T0, ExpiryPolicy::new(Duration::from_secs(30), 0.8));

        assert_eq!(entry.state_at(T0), EntryState::Fresh);
        assert_eq!(entry.state_at(T0 + Duration::from_millis(23_999)), EntryState::Fresh);
        assert_eq!(entry.state_at(T0 + Duration::from_secs(24)), EntryState::Stale);
        assert_eq!(entry.state_at(T0 + Duration::from_millis(29_999)), EntryState::Stale);
        assert_eq!(entry.state_at(T0 + Duration::from_secs(30)), EntryState::Expired);
    }

    #[test]
    fn from_parts_keeps_soft_before_hard() {
        let entry = CacheEntry::from_parts(1, T0, T0 + Duration::from_secs(10), T0 + Duration::from_secs(5), BTreeSet::new(), 3);
        assert_eq!(entry.soft_expires_at(), entry.hard_expires_at());
        assert_eq!(entry.version(), 3);
    }

    #[test]
    fn remaining_ttl_is_none_after_deadline() {
        let entry = CacheEntry::new(1, T0, ExpiryPolicy::new(Duration::from_secs(10), 0.5));
        assert_eq!(entry.remaining_ttl(T0 + Duration::from_secs(4)), Some(Duration::from_secs(6)));
        assert_eq!(entry.remaining_ttl(T0 + Duration::from_secs(10)), None);
    }

    #[test]
    fn entry_survives_json() {
        let entry = CacheEntry::new("payload".to_string(), T0, ExpiryPolicy::default())
            .with_tags(["kpi", "dealership_4"])
            .with_version(11);
        let json = serde_json::to_vec(&entry).unwrap();
        let back: CacheEntry<String> = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, entry);
    }
}
