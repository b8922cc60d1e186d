//! Per-key mutual exclusion.
//!
//! Every auction mutation runs read-modify-persist under the lock for its
//! auction id, so two bids on one auction can never both read the same
//! `current_bid`. Unrelated keys never contend. Idle slots are removed as
//! soon as the last holder or waiter goes away.

use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

pub struct KeyedLock<K> {
    slots: Mutex<FxHashMap<K, Slot>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    /// Wait until `key` is free and hold it until the guard is dropped.
    ///
    /// The guard may be held across `.await` points.
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let slot = {
            let mut slots = self.slots();
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        // Built before waiting so a cancelled waiter still releases its slot
        let mut held = KeyGuard {
            owner: self,
            key,
            slot,
            guard: None,
        };
        held.guard = Some(held.slot.clone().lock_owned().await);
        held
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, FxHashMap<K, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on one key.
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLock<K>,
    key: K,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.owner.slots();
        // Clones are only taken under the map lock, so 2 means: the map and us.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
