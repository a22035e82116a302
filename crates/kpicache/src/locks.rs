// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key ordering of writes and evictions.
//!
//! Every write, promotion and eviction of a key runs under that key's lock, so
//! an eviction and its index cleanup can never interleave with a write of the
//! same key. Each slot also counts evictions, which lets a reader that fetched
//! an entry without the lock tell whether the entry was invalidated since.
//! Slots are created on demand and dropped with their last handle.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

type SlotMap = Arc<Mutex<HashMap<String, Arc<Slot>>>>;

#[derive(Debug, Default)]
struct Slot {
    lock: AsyncMutex<()>,
    evictions: AtomicU64,
}

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    slots: SlotMap,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `key`, creating it if needed.
    pub fn slot(&self, key: &str) -> KeySlot {
        let mut slots = self.slots.lock();
        let slot = Arc::clone(slots.entry(key.to_owned()).or_default());
        KeySlot {
            slots: Arc::clone(&self.slots),
            key: key.to_owned(),
            slot,
        }
    }

    /// Returns how many keys have a live slot.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// A handle on one key's slot.
#[derive(Debug)]
pub(crate) struct KeySlot {
    slots: SlotMap,
    key: String,
    slot: Arc<Slot>,
}

impl KeySlot {
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.slot.lock.lock().await
    }

    /// Returns how many times the key was evicted while the slot was alive.
    pub fn evictions(&self) -> u64 {
        self.slot.evictions.load(Ordering::Acquire)
    }

    /// Records an eviction. Call with the lock held.
    pub fn evicted(&self) {
        self.slot.evictions.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // Handles are only created under the map lock, so the count cannot grow here.
        let last = Arc::strong_count(&self.slot) == 2;
        if last && slots.get(&self.key).is_some_and(|slot| Arc::ptr_eq(slot, &self.slot)) {
            slots.remove(&self.key);
        }
    }
}
