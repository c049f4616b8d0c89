//! Keyed single-flight gate.
//!
//! Concurrent cache misses for the same key must coalesce into one upstream
//! call: the first caller holds the key's lock while it fetches, the rest
//! queue on the same lock and re-check the cache once they acquire it.
//! Locks are reference counted and dropped from the map as soon as nobody
//! holds or waits on them, so the map stays proportional to in-flight work.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::entry::MetaKey;

#[derive(Default)]
struct FlightMap {
    locks: HashMap<MetaKey, (Arc<AsyncMutex<()>>, usize)>,
}

/// Collection of per-key in-flight locks.
#[derive(Default)]
pub struct FlightGuards {
    map: Arc<Mutex<FlightMap>>,
}

impl FlightGuards {
    /// Creates an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires exclusive flight for the key, waiting behind any current
    /// holder. This is a suspension point.
    pub async fn acquire(&self, key: MetaKey) -> FlightGuard {
        let lock = {
            let mut map = self.map.lock();
            let slot = map
                .locks
                .entry(key.clone())
                .or_insert_with(|| (Arc::new(AsyncMutex::new(())), 0));
            slot.1 += 1;
            Arc::clone(&slot.0)
        };

        let guard = lock.lock_owned().await;

        FlightGuard {
            map: Arc::clone(&self.map),
            key,
            _guard: guard,
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().locks.len()
    }

    /// Whether no flights are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held while one caller owns the flight for a key.
pub struct FlightGuard {
    map: Arc<Mutex<FlightMap>>,
    key: MetaKey,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if let Some(slot) = map.locks.get_mut(&self.key) {
            slot.1 -= 1;
            if slot.1 == 0 {
                map.locks.remove(&self.key);
            }
        }
    }
}
