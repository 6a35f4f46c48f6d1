//! Beacon directory and submitted-token log: persistence abstraction with an
//! in-memory implementation and a JSON snapshot format.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use waymark_core::{BeaconId, PoLToken, PublicKey};

/// One registered beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    /// Stable device identifier burned into the hardware.
    pub technical_id: BeaconId,
    pub display_name: String,
    pub location: String,
    /// Ed25519 verification key for this beacon's signatures.
    pub public_key: PublicKey,
    /// Symmetric key sealing commands for this beacon. Provisioned with the
    /// device; never admin-editable.
    pub sealing_key: [u8; 32],
    /// Monotonic replay watermark; advanced only by verified tokens/acks.
    pub last_known_counter: u64,
}

impl Beacon {
    /// Admin edit path: display name and location only. Key material and the
    /// counter watermark are never touched here.
    pub fn update_details(&mut self, display_name: &str, location: &str) {
        self.display_name = display_name.to_string();
        self.location = location.to_string();
    }
}

/// Persistence consumed by the service: beacon records, counter watermarks,
/// and the append-only token log.
pub trait BeaconStore: Send + Sync {
    fn get(&self, id: BeaconId) -> Option<Beacon>;
    fn upsert(&self, beacon: Beacon);
    /// Persist a counter watermark. A value at or below the stored one is
    /// ignored; returns false for an unknown beacon.
    fn set_counter(&self, id: BeaconId, counter: u64) -> bool;
    fn list(&self) -> Vec<Beacon>;
    fn append_token(&self, token: PoLToken);
    fn tokens_for(&self, id: BeaconId) -> Vec<PoLToken>;
}

#[derive(Default)]
pub struct MemoryStore {
    beacons: Mutex<HashMap<BeaconId, Beacon>>,
    tokens: Mutex<Vec<PoLToken>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    beacons: Vec<Beacon>,
    tokens: Vec<PoLToken>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn beacons(&self) -> std::sync::MutexGuard<'_, HashMap<BeaconId, Beacon>> {
        self.beacons
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, Vec<PoLToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Serialize the whole store for a snapshot file.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let snapshot = Snapshot {
            beacons: self.list(),
            tokens: self.tokens().clone(),
        };
        serde_json::to_string_pretty(&snapshot)
    }

    /// Rebuild a store from a snapshot file.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(s)?;
        let store = Self::new();
        for b in snapshot.beacons {
            store.upsert(b);
        }
        *store.tokens() = snapshot.tokens;
        Ok(store)
    }
}

impl BeaconStore for MemoryStore {
    fn get(&self, id: BeaconId) -> Option<Beacon> {
        self.beacons().get(&id).cloned()
    }

    fn upsert(&self, beacon: Beacon) {
        self.beacons().insert(beacon.technical_id, beacon);
    }

    fn set_counter(&self, id: BeaconId, counter: u64) -> bool {
        match self.beacons().get_mut(&id) {
            Some(b) => {
                if counter > b.last_known_counter {
                    b.last_known_counter = counter;
                }
                true
            }
            None => false,
        }
    }

    fn list(&self) -> Vec<Beacon> {
        let mut out: Vec<Beacon> = self.beacons().values().cloned().collect();
        out.sort_by_key(|b| b.technical_id);
        out
    }

    fn append_token(&self, token: PoLToken) {
        self.tokens().push(token);
    }

    fn tokens_for(&self, id: BeaconId) -> Vec<PoLToken> {
        self.tokens()
            .iter()
            .filter(|t| t.beacon_id() == id)
            .cloned()
            .collect()
    }
}
