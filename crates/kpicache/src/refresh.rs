// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Background refresh scheduling.
//!
//! A stale read schedules at most one refresh per key. Each refresh is its own
//! task, tracked by key so it can be cancelled when the key is invalidated or
//! the service shuts down.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

#[derive(Debug)]
struct InFlight {
    id: u64,
    abort: AbortHandle,
}

/// Tracks refresh tasks in flight, one per key.
#[derive(Debug, Default)]
pub(crate) struct RefreshTracker {
    in_flight: InFlightMap,
    next_id: AtomicU64,
}

/// Marks the key as no longer in flight when the task ends, however it ends.
struct FinishGuard {
    in_flight: InFlightMap,
    key: String,
    id: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&self.key).is_some_and(|f| f.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

impl RefreshTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `refresh` for `key` unless a refresh for it is already running.
    ///
    /// Returns true if a task was spawned.
    pub fn spawn_once<F>(&self, key: &str, refresh: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(key) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = FinishGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.to_owned(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            refresh.await;
        });
        in_flight.insert(
            key.to_owned(),
            InFlight {
                id,
                abort: handle.abort_handle(),
            },
        );
        true
    }

    /// Cancels the refresh task for `key`, if any.
    ///
    /// A load the task already handed to the single-flight table keeps running.
    pub fn cancel(&self, key: &str) -> bool {
        self.in_flight.lock().remove(key).map(|f| f.abort.abort()).is_some()
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Cancels every refresh in flight.
    pub fn shutdown(&self) {
        for (_, in_flight) in self.in_flight.lock().drain() {
            in_flight.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::Notify;

    use super::*;

    #[tokio::test]
    async fn one_refresh_per_key() {
        let tracker = RefreshTracker::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        for _ in 0..5 {
            let runs = Arc::clone(&runs);
            let release = Arc::clone(&release);
            tracker.spawn_once("k", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
            });
        }
        assert!(tracker.spawn_once("other", async {}));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(tracker.is_refreshing("k"));

        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!tracker.is_refreshing("k"));
        assert_eq!(tracker.pending(), 0);

        // A finished refresh does not block the next one.
        assert!(tracker.spawn_once("k", async {}));
    }

    #[tokio::test]
    async fn cancel_aborts_task() {
        let tracker = RefreshTracker::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        tracker.spawn_once("k", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        assert!(tracker.cancel("k"));
        assert!(!tracker.cancel("k"));
        assert!(!tracker.is_refreshing("k"));

        // The aborted task's guard must not remove a newer refresh.
        assert!(tracker.spawn_once("k", std::future::pending()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tracker.is_refreshing("k"));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tracker.shutdown();
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn panicking_refresh_is_released() {
        let tracker = RefreshTracker::new();
        tracker.spawn_once("k", async { panic!("refresh blew up") });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!tracker.is_refreshing("k"));
    }
}
