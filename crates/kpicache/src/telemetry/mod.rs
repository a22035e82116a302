// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured cache events emitted through `tracing`.
//!
//! Every notable cache outcome is recorded as a `cache.event` with the cache
//! name, the operation, the activity and, when timed, the duration. The log
//! level is chosen by the activity.

use std::time::Duration;

use tokio::time::Instant;
use tracing::Level;

pub(crate) mod attributes;
#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheOperation {
    Get,
    GetOrLoad,
    Set,
    Invalidate,
    Refresh,
    Load,
    Probe,
    Sweep,
    Warm,
    Event,
}

impl CacheOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "cache.get",
            Self::GetOrLoad => "cache.get_or_load",
            Self::Set => "cache.set",
            Self::Invalidate => "cache.invalidate",
            Self::Refresh => "cache.refresh",
            Self::Load => "cache.load",
            Self::Probe => "cache.probe",
            Self::Sweep => "cache.sweep",
            Self::Warm => "cache.warm",
            Self::Event => "cache.on_event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheActivity {
    Hit,
    StaleHit,
    Miss,
    Expired,
    Inserted,
    Invalidated,
    Promoted,
    Coalesced,
    Refreshed,
    RefreshDiscarded,
    Degraded,
    Recovered,
    Error,
}

impl CacheActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache.hit",
            Self::StaleHit => "cache.stale_hit",
            Self::Miss => "cache.miss",
            Self::Expired => "cache.expired",
            Self::Inserted => "cache.inserted",
            Self::Invalidated => "cache.invalidated",
            Self::Promoted => "cache.promoted",
            Self::Coalesced => "cache.coalesced",
            Self::Refreshed => "cache.refreshed",
            Self::RefreshDiscarded => "cache.refresh_discarded",
            Self::Degraded => "cache.degraded",
            Self::Recovered => "cache.recovered",
            Self::Error => "cache.error",
        }
    }

    pub fn level(self) -> Level {
        match self {
            Self::Hit | Self::StaleHit | Self::Miss | Self::Coalesced | Self::RefreshDiscarded => Level::DEBUG,
            Self::Expired | Self::Inserted | Self::Invalidated | Self::Promoted | Self::Refreshed | Self::Recovered => Level::INFO,
            Self::Degraded => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

/// Emits cache events under one cache name.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Telemetry {
    name: &'static str,
}

impl Telemetry {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn record(self, operation: CacheOperation, activity: CacheActivity, key: &str, duration: Option<Duration>) {
        Self::emit(self.name, operation, activity, key, duration);
    }

    fn emit(cache_name: &'static str, operation: CacheOperation, activity: CacheActivity, key: &str, duration: Option<Duration>) {
        let op = operation.as_str();
        let ev = activity.as_str();
        let duration_ns = duration.map(|d| d.as_nanos());

        // Tracing level must be constant, so a macro selects the level.
        // Field names must match the constants in attributes.rs.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    cache.name = cache_name,
                    cache.operation = op,
                    cache.activity = ev,
                    cache.key = key,
                    cache.duration_ns = ?duration_ns,
                    "cache.event"
                )
            };
        }

        match activity.level() {
            Level::ERROR => emit_event!(error),
            Level::WARN => emit_event!(warn),
            Level::INFO => emit_event!(info),
            _ => emit_event!(debug),
        }
    }
}

/// Result of a timed async operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timed<R> {
    pub result: R,
    pub duration: Duration,
}

/// Awaits `f` and measures how long it took.
pub(crate) async fn timed<F: Future>(f: F) -> Timed<F::Output> {
    let start = Instant::now();
    let result = f.await;
    Timed {
        result,
        duration: start.elapsed(),
    }
}
