// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hit, miss and latency accounting.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;

/// Upper bounds, in milliseconds, of the latency buckets. The last bucket is unbounded.
pub const LATENCY_BUCKETS_MS: [u64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];

/// What a statistics sample counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum StatKind {
    /// A fresh value was served.
    Hit,
    /// A stale value was served.
    StaleHit,
    /// No usable value was cached.
    Miss,
    /// A value was written.
    Set,
    /// A key was invalidated.
    Invalidation,
    /// An operation failed, surfaced to the caller or not.
    Error,
    /// A background refresh replaced a value.
    Refresh,
    /// A caller attached to a load already in flight.
    Coalesced,
}

#[derive(Clone, Debug, Default)]
struct Counters {
    hits: u64,
    stale_hits: u64,
    misses: u64,
    sets: u64,
    invalidations: u64,
    errors: u64,
    refreshes: u64,
    coalesced: u64,
    latency_samples: u64,
    latency_total: Duration,
    under_threshold: u64,
    buckets: [u64; LATENCY_BUCKETS_MS.len() + 1],
}

impl Counters {
    fn record(&mut self, kind: StatKind, duration: Option<Duration>, threshold: Duration) {
        let counter = match kind {
            StatKind::Hit => &mut self.hits,
            StatKind::StaleHit => &mut self.stale_hits,
            StatKind::Miss => &mut self.misses,
            StatKind::Set => &mut self.sets,
            StatKind::Invalidation => &mut self.invalidations,
            StatKind::Error => &mut self.errors,
            StatKind::Refresh => &mut self.refreshes,
            StatKind::Coalesced => &mut self.coalesced,
        };
        *counter += 1;

        if let Some(duration) = duration {
            self.latency_samples += 1;
            self.latency_total += duration;
            if duration < threshold {
                self.under_threshold += 1;
            }
            let millis = duration.as_millis();
            let bucket = LATENCY_BUCKETS_MS
                .iter()
                .position(|bound| millis <= u128::from(*bound))
                .unwrap_or(LATENCY_BUCKETS_MS.len());
            self.buckets[bucket] += 1;
        }
    }

    #[expect(clippy::cast_precision_loss, reason = "counters are far below 2^52")]
    fn snapshot(&self, threshold: Duration) -> StatsSnapshot {
        let lookups = self.hits + self.stale_hits + self.misses;
        let ratio = |part: u64, whole: u64| if whole == 0 { 0.0 } else { part as f64 / whole as f64 };

        StatsSnapshot {
            hits: self.hits,
            stale_hits: self.stale_hits,
            misses: self.misses,
            sets: self.sets,
            invalidations: self.invalidations,
            errors: self.errors,
            refreshes: self.refreshes,
            coalesced: self.coalesced,
            hit_rate: ratio(self.hits + self.stale_hits, lookups),
            latency_samples: self.latency_samples,
            avg_latency_ms: if self.latency_samples == 0 {
                0.0
            } else {
                self.latency_total.as_secs_f64() * 1000.0 / self.latency_samples as f64
            },
            latency_threshold_ms: u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX),
            percent_under_threshold_ms: ratio(self.under_threshold, self.latency_samples) * 100.0,
            latency_buckets: self
                .buckets
                .iter()
                .enumerate()
                .map(|(index, count)| LatencyBucket {
                    le_ms: LATENCY_BUCKETS_MS.get(index).copied(),
                    count: *count,
                })
                .collect(),
        }
    }
}

/// A point-in-time copy of the counters.
///
/// All fields are read under one lock, so a snapshot is internally consistent.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Fresh values served.
    pub hits: u64,
    /// Stale values served while a refresh was requested.
    pub stale_hits: u64,
    /// Lookups that found no usable value.
    pub misses: u64,
    /// Values written.
    pub sets: u64,
    /// Keys invalidated.
    pub invalidations: u64,
    /// Failed operations, including absorbed distributed failures.
    pub errors: u64,
    /// Background refreshes that replaced a value.
    pub refreshes: u64,
    /// Callers that attached to a load already in flight.
    pub coalesced: u64,
    /// Share of lookups served from cache, fresh or stale, in `[0, 1]`.
    pub hit_rate: f64,
    /// Number of timed lookups behind the latency figures.
    pub latency_samples: u64,
    /// Mean lookup latency.
    pub avg_latency_ms: f64,
    /// The fast-lookup threshold.
    pub latency_threshold_ms: u64,
    /// Percentage of timed lookups faster than the threshold; zero when nothing was timed.
    pub percent_under_threshold_ms: f64,
    /// Lookup latency histogram, in ascending bucket order.
    pub latency_buckets: Vec<LatencyBucket>,
}

/// One latency histogram bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LatencyBucket {
    /// Inclusive upper bound in milliseconds; `None` for the overflow bucket.
    pub le_ms: Option<u64>,
    /// Samples in this bucket.
    pub count: u64,
}

#[derive(Debug, Default)]
struct Inner {
    global: Counters,
    groups: HashMap<String, Counters>,
}

/// Counters kept globally and per logical group.
///
/// Counters only grow until [`reset`](Self::reset) is called.
#[derive(Debug)]
pub(crate) struct Stats {
    inner: Mutex<Inner>,
    threshold: Duration,
}

impl Stats {
    /// Creates empty statistics with the given fast-lookup threshold.
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            threshold,
        }
    }

    /// Records one sample globally and, when given, for `group`.
    pub fn record(&self, kind: StatKind, group: Option<&str>, duration: Option<Duration>) {
        let mut inner = self.inner.lock();
        inner.global.record(kind, duration, self.threshold);
        if let Some(group) = group {
            match inner.groups.get_mut(group) {
                Some(counters) => counters.record(kind, duration, self.threshold),
                None => {
                    let mut counters = Counters::default();
                    counters.record(kind, duration, self.threshold);
                    inner.groups.insert(group.to_owned(), counters);
                }
            }
        }
    }

    /// Returns the global counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().global.snapshot(self.threshold)
    }

    /// Returns the counters of one group, if it has recorded anything.
    #[must_use]
    pub fn group(&self, group: &str) -> Option<StatsSnapshot> {
        self.inner.lock().groups.get(group).map(|c| c.snapshot(self.threshold))
    }

    /// Returns the names of all groups that have recorded samples.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.inner.lock().groups.keys().cloned().collect();
        groups.sort_unstable();
        groups
    }

    /// Clears every counter.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }
}
