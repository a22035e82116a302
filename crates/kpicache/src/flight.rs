// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key coalescing of concurrent loads.
//!
//! The first caller for a key becomes the leader and spawns the work as its own
//! task; later callers attach to the same shared result. Because the work is not
//! driven by the leader's future, dropping the leader never strands the waiters.
//! The pending marker is removed by a guard owned by the task, so it is released
//! when the work finishes, panics or is aborted, and always before the result
//! reaches any waiter.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::CacheError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;
type PendingMap<T> = Arc<Mutex<HashMap<String, Pending<T>>>>;

struct Pending<T> {
    id: u64,
    requesters: usize,
    result: SharedResult<T>,
    abort: AbortHandle,
}

/// The outcome of [`SingleFlight::resolve`].
#[derive(Debug)]
pub(crate) struct Resolved<T> {
    pub result: Result<T, CacheError>,
    /// True if the caller attached to work started by another caller.
    pub joined: bool,
}

pub(crate) struct SingleFlight<T> {
    pending: PendingMap<T>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            pending: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }
}

/// Removes the pending marker for `key` if it still belongs to `id`.
struct PendingGuard<T> {
    pending: PendingMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.key).is_some_and(|p| p.id == self.id) {
            pending.remove(&self.key);
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key` unless a run is already in flight, in which case
    /// its result is awaited instead.
    ///
    /// Every caller attached to one run receives a clone of the same value or error.
    pub async fn resolve<F, Fut>(&self, key: &str, work: F) -> Resolved<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let (result, joined) = self.join_or_lead(key, work);
        Resolved {
            result: result.await,
            joined,
        }
    }

    fn join_or_lead<F, Fut>(&self, key: &str, work: F) -> (SharedResult<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get_mut(key) {
            existing.requesters += 1;
            return (existing.result.clone(), true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            key: key.to_owned(),
            id,
        };
        let fut = work();

        // Spawned while the map is locked so the guard cannot run before the marker exists.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await
        });
        let abort = handle.abort_handle();

        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(CacheError::FactoryPanicked(panic_message(e.into_panic()))),
                Err(_) => Err(CacheError::Cancelled),
            }
        }
        .boxed()
        .shared();

        pending.insert(
            key.to_owned(),
            Pending {
                id,
                requesters: 1,
                result: result.clone(),
                abort,
            },
        );
        (result, false)
    }
}

impl<T> SingleFlight<T> {
    /// Returns true if a run is in flight for `key`.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Returns how many callers are attached to the run for `key`.
    pub fn requesters(&self, key: &str) -> usize {
        self.pending.lock().get(key).map_or(0, |p| p.requesters)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Aborts every run in flight; attached callers receive [`CacheError::Cancelled`].
    pub fn abort_all(&self) {
        for pending in self.pending.lock().values() {
            pending.abort.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
