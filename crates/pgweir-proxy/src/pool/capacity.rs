//! Per-backend connection capacity accounting
//!
//! One mutex over the whole table; every operation is a single O(1) step on
//! a short critical section. Counts in_use + in_pool against max
//! (0 = unlimited).

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Entry {
    in_use: u32,
    in_pool: u32,
    max: u32,
}

/// Caps concurrent backend connections per backend name. Owns counters only,
/// never sockets.
#[derive(Debug)]
pub struct CapacityManager {
    state: Mutex<HashMap<String, Entry>>,
}

impl CapacityManager {
    /// Seed the table with `(backend name, max)` pairs from configuration.
    pub fn new(backends: impl IntoIterator<Item = (String, u32)>) -> Self {
        let state = backends
            .into_iter()
            .map(|(name, max)| {
                (
                    name,
                    Entry {
                        in_use: 0,
                        in_pool: 0,
                        max,
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(state),
        }
    }

    /// Claim a slot for a fresh connection. True if `max = 0` or
    /// `in_use + in_pool < max`; false when exhausted or the backend is
    /// unknown.
    pub fn acquire(&self, backend: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.get_mut(backend) else {
            return false;
        };
        if entry.max != 0 && entry.in_use + entry.in_pool >= entry.max {
            return false;
        }
        entry.in_use += 1;
        true
    }

    /// A connection in use was closed. Idempotent on absent keys.
    pub fn release(&self, backend: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(backend) {
            if entry.in_use > 0 {
                entry.in_use -= 1;
            }
        }
    }

    /// A connection in use was parked in the idle cache. Idempotent on
    /// absent keys.
    pub fn put_into_pool(&self, backend: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(backend) {
            if entry.in_use > 0 {
                entry.in_use -= 1;
                entry.in_pool += 1;
            }
        }
    }

    /// Claim a parked connection. True only when one is counted in the pool.
    pub fn take_from_pool(&self, backend: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.get_mut(backend) else {
            return false;
        };
        if entry.in_pool == 0 {
            return false;
        }
        entry.in_pool -= 1;
        entry.in_use += 1;
        true
    }

    /// Current `(in_use, in_pool)` for a backend.
    pub fn counters(&self, backend: &str) -> Option<(u32, u32)> {
        let state = self.state.lock();
        state.get(backend).map(|e| (e.in_use, e.in_pool))
    }
}
