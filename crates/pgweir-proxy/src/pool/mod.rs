//! Pool layer: capacity accounting, idle-connection cache and wait queue.
//!
//! The capacity manager owns counters only; the idle cache owns sockets; the
//! wait queue owns wake channels. A backend socket is held by exactly one of
//! {a session (in-use), the idle cache} at any time.

pub mod capacity;
pub mod idle;
pub mod wait_queue;

use std::sync::Arc;

pub use capacity::CapacityManager;
pub use idle::{IdleCache, IdleConnection};
pub use wait_queue::WaitQueue;

/// Key for the idle cache and wait queue: a pooled connection is only
/// reusable by a client with the same backend, user and database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub backend: String,
    pub user: String,
    pub database: String,
}

impl PoolKey {
    pub fn new(backend: &str, user: &str, database: &str) -> Self {
        Self {
            backend: backend.to_string(),
            user: user.to_string(),
            database: database.to_string(),
        }
    }
}

/// RAII pairing for capacity counters: every successful `acquire` or
/// `take_from_pool` is wrapped in a lease, so every path out of a session,
/// error paths included, performs exactly one matching `release` or
/// `put_into_pool`.
///
/// Dropping a held lease releases the slot and wakes one waiter for the
/// backend, which then retries a fresh acquire (wake policy (a); the
/// put-into-pool path wakes by full key instead, from the caller, right
/// after the idle-cache insert).
#[derive(Debug)]
pub struct BackendLease {
    capacity: Arc<CapacityManager>,
    wait_queue: Arc<WaitQueue>,
    backend: String,
    held: bool,
}

impl BackendLease {
    /// Wrap a slot already counted in_use by `acquire` or `take_from_pool`.
    pub fn new(capacity: Arc<CapacityManager>, wait_queue: Arc<WaitQueue>, backend: &str) -> Self {
        Self {
            capacity,
            wait_queue,
            backend: backend.to_string(),
            held: true,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Move the slot from in_use to in_pool. The caller has already handed
    /// the socket to the idle cache and is responsible for the per-key wake.
    pub fn put_into_pool(mut self) {
        self.capacity.put_into_pool(&self.backend);
        self.held = false;
    }

    /// Release explicitly (same as drop; spells out intent at call sites).
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        if self.held {
            self.capacity.release(&self.backend);
            self.wait_queue.wake_for_backend(&self.backend);
        }
    }
}
