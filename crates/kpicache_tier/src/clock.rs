// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wall-clock source used to stamp cache entries.

use std::{sync::Arc, time::SystemTime};

use parking_lot::Mutex;

#[cfg(any(feature = "test-util", test))]
use std::time::Duration;

/// Provides the current wall-clock time for entry timestamps.
///
/// Entries carry absolute timestamps so they can travel through a distributed
/// backend; the clock is the single place those timestamps come from. In
/// production this is the system clock. Tests obtain a controllable clock from
/// [`ClockControl`] (feature `test-util`).
///
/// # Examples
///
/// ```
/// use kpicache_tier::Clock;
///
/// let clock = Clock::system();
/// let now = clock.now();
/// assert!(now > std::time::UNIX_EPOCH);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Clock {
    controlled: Option<Arc<Mutex<SystemTime>>>,
}

impl Clock {
    /// Creates a clock that reads the system time.
    #[must_use]
    pub fn system() -> Self {
        Self { controlled: None }
    }

    /// Returns the current time according to this clock.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        match &self.controlled {
            Some(now) => *now.lock(),
            None => SystemTime::now(),
        }
    }
}

/// Controls the flow of time for a [`Clock`] in tests.
///
/// All clocks created from the same control observe the same time, and time
/// only moves when [`advance`](Self::advance) is called.
///
/// # Examples
///
/// ```ignore
/// use kpicache_tier::ClockControl;
/// use std::time::Duration;
///
/// let control = ClockControl::new();
/// let clock = control.to_clock();
/// let start = clock.now();
///
/// control.advance(Duration::from_secs(25));
/// assert_eq!(clock.now().duration_since(start).unwrap(), Duration::from_secs(25));
/// ```
#[cfg(any(feature = "test-util", test))]
#[derive(Debug, Clone)]
pub struct ClockControl {
    now: Arc<Mutex<SystemTime>>,
}

#[cfg(any(feature = "test-util", test))]
impl Default for ClockControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(feature = "test-util", test))]
impl ClockControl {
    /// Creates a control frozen at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self::new_at(SystemTime::now())
    }

    /// Creates a control frozen at the given time.
    #[must_use]
    pub fn new_at(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Returns a clock driven by this control.
    #[must_use]
    pub fn to_clock(&self) -> Clock {
        Clock {
            controlled: Some(Arc::clone(&self.now)),
        }
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }
}
