//! Shared fixtures for keeper integration tests: a scripted clock whose
//! two readings the tests move independently, an in-memory store, and
//! passphrase helpers.

// Each integration test binary compiles this module separately and uses
// a different subset of it.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use timefence_core::cipher::PassphraseCipher;
use timefence_core::clock::ClockSource;
use timefence_core::store::{StateStore, StoreError};

/// Passphrase used by every fixture keeper.
pub const PASSPHRASE: &str = "fixture-passphrase";

/// Ticks per millisecond of the scripted monotonic clock (nanoseconds).
pub const MONO_TICKS_PER_MS: i64 = 1_000_000;

/// Ticks per millisecond of the scripted wall clock (100-ns units).
pub const WALL_TICKS_PER_MS: i64 = 10_000;

/// Builds the fixture cipher.
pub fn cipher() -> PassphraseCipher {
    PassphraseCipher::new(&passphrase())
}

/// Builds the fixture passphrase.
pub fn passphrase() -> SecretString {
    SecretString::from(PASSPHRASE.to_string())
}

/// Clock whose monotonic and wall readings are advanced explicitly, so a
/// test can replay restarts, reboots, and wall-clock jumps.
pub struct ScriptedClock {
    readings: Mutex<(i64, i64)>,
}

impl ScriptedClock {
    /// Starts both readings at arbitrary non-zero epochs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new((7_000_000_000, 16_000_000_000_000_000)),
        })
    }

    /// Advances both readings together, as real time passing would.
    pub fn tick_ms(&self, ms: i64) {
        let mut readings = self.readings.lock().unwrap();
        readings.0 += ms * MONO_TICKS_PER_MS;
        readings.1 += ms * WALL_TICKS_PER_MS;
    }

    /// Moves only the wall reading: an administrative clock change.
    pub fn jump_wall_ms(&self, ms: i64) {
        self.readings.lock().unwrap().1 += ms * WALL_TICKS_PER_MS;
    }

    /// Resets the monotonic reading to near zero: a reboot.
    pub fn reboot(&self, downtime_ms: i64) {
        let mut readings = self.readings.lock().unwrap();
        readings.0 = MONO_TICKS_PER_MS;
        readings.1 += downtime_ms * WALL_TICKS_PER_MS;
    }
}

/// Local newtype over `Arc<ScriptedClock>` so `ClockSource` can be
/// implemented for it here: the orphan rules forbid implementing a
/// foreign trait for `Arc<T>` directly from an integration test crate.
pub struct ScriptedClockHandle(pub Arc<ScriptedClock>);

impl ClockSource for ScriptedClockHandle {
    fn mono_now(&self) -> i64 {
        self.0.readings.lock().unwrap().0
    }

    fn wall_now(&self) -> i64 {
        self.0.readings.lock().unwrap().1
    }

    fn mono_frequency(&self) -> u64 {
        1_000_000_000
    }
}

/// In-memory store shared across keeper sessions within one test.
#[derive(Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current persisted blob, if any.
    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().unwrap().clone()
    }

    /// Replaces the persisted blob out-of-band, as an attacker would.
    pub fn overwrite(&self, blob: Vec<u8>) {
        *self.blob.lock().unwrap() = Some(blob);
    }
}

/// Local newtype over `Arc<MemoryStore>` so `StateStore` can be
/// implemented for it here: the orphan rules forbid implementing a
/// foreign trait for `Arc<T>` directly from an integration test crate.
pub struct MemoryStoreHandle(pub Arc<MemoryStore>);

impl StateStore for MemoryStoreHandle {
    fn load(&self) -> Result<Vec<u8>, StoreError> {
        self.0.blob.lock().unwrap().clone().ok_or(StoreError::NotFound)
    }

    fn save(&self, blob: &[u8]) -> Result<(), StoreError> {
        *self.0.blob.lock().unwrap() = Some(blob.to_vec());
        Ok(())
    }
}
