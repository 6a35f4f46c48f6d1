//! Counter & replay guard: per-beacon monotonic watermarks with an atomic
//! advance-if-greater operation. A counter at or below the watermark is a
//! replay; the stored value never decreases.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::identity::BeaconId;

pub struct CounterStore {
    counters: Mutex<HashMap<BeaconId, u64>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BeaconId, u64>> {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Preload a persisted watermark. Keeps the higher value if one is
    /// already present.
    pub fn hydrate(&self, beacon_id: BeaconId, counter: u64) {
        let mut map = self.lock();
        let entry = map.entry(beacon_id).or_insert(counter);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Advance the watermark if `counter` is strictly greater. Returns true
    /// and records the new value on success; false (replay, no mutation)
    /// otherwise. Compare-and-store happens under one lock acquisition, so
    /// two racing verifications for the same beacon cannot both win on the
    /// same counter value.
    pub fn advance(&self, beacon_id: BeaconId, counter: u64) -> bool {
        let mut map = self.lock();
        match map.get_mut(&beacon_id) {
            Some(current) if counter <= *current => false,
            Some(current) => {
                *current = counter;
                true
            }
            None => {
                map.insert(beacon_id, counter);
                true
            }
        }
    }

    /// Current watermark, if the beacon has ever been seen.
    pub fn current(&self, beacon_id: BeaconId) -> Option<u64> {
        self.lock().get(&beacon_id).copied()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}
