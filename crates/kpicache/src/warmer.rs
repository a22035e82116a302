// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use tokio::{
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Per-key periodic tasks.
///
/// Each key owns an independent interval task, so a slow or failing tick for
/// one key never delays another. Scheduling a key again replaces its task.
#[derive(Debug, Default)]
pub(crate) struct Warmer {
    schedules: Mutex<HashMap<String, AbortHandle>>,
}

impl Warmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `tick` for `key` immediately and then every `interval` until the
    /// key is unscheduled or `tick` returns false. A zero interval is treated
    /// as one millisecond.
    pub fn schedule<F, Fut>(&self, key: &str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now(), interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick().await {
                    break;
                }
            }
        });

        if let Some(previous) = self.schedules.lock().insert(key.to_owned(), handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Stops the task for `key`. Returns true if one was scheduled.
    pub fn unschedule(&self, key: &str) -> bool {
        self.schedules.lock().remove(key).map(|handle| handle.abort()).is_some()
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.schedules.lock().get(key).is_some_and(|handle| !handle.is_finished())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.schedules.lock().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.schedules.lock().drain() {
            handle.abort();
        }
    }
}
