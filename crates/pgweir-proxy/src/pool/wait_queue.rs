//! Wait queue for sessions parked on an exhausted backend
//!
//! Insertion order is the wake order: when a connection is returned (or a
//! slot is freed), the oldest waiter for the key is woken, exactly one per
//! call. A session parks by awaiting its ticket under `tokio::time::timeout`
//! and on expiry removes itself and sends 53300 to its client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::PoolKey;

/// Applied when a backend configures `query_wait_timeout_sec: 0`.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 60;

/// Wait duration for a configured timeout (0 = the queue default).
pub fn wait_timeout(timeout_sec: u32) -> Duration {
    if timeout_sec == 0 {
        Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS)
    } else {
        Duration::from_secs(u64::from(timeout_sec))
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    key: PoolKey,
    tx: oneshot::Sender<()>,
}

/// Handed to the parked session; dropping the receiver makes the waiter
/// dead, and a dead waiter counts as already removed when woken.
#[derive(Debug)]
pub struct WaitTicket {
    pub id: u64,
    pub rx: oneshot::Receiver<()>,
}

/// FIFO wait queue, one per worker (or per single-process instance).
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    next_id: AtomicU64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a session on the key. The caller awaits the ticket with its
    /// configured timeout and must call `remove` if it gives up.
    pub fn enqueue(&self, key: PoolKey) -> WaitTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(Waiter { id, key, tx });
        WaitTicket { id, rx }
    }

    /// A connection was just parked in the idle cache for this key: wake the
    /// oldest waiter with the exact same (backend, user, database). At most
    /// one live waiter is woken.
    pub fn wake_for_key(&self, key: &PoolKey) -> bool {
        self.wake_first(|w| &w.key == key)
    }

    /// A capacity slot was just freed on this backend: wake the oldest
    /// waiter for the backend regardless of user/database, so it can retry
    /// a fresh acquire.
    pub fn wake_for_backend(&self, backend: &str) -> bool {
        self.wake_first(|w| w.key.backend == backend)
    }

    fn wake_first(&self, pred: impl Fn(&Waiter) -> bool) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(pos) = waiters.iter().position(&pred) {
            let waiter = waiters.remove(pos).expect("position just found");
            if waiter.tx.send(()).is_ok() {
                return true;
            }
            // Receiver already dropped (session died): treat as removed and
            // try the next-oldest.
        }
        false
    }

    /// Purge a waiter by ticket id (timeout or session teardown).
    pub fn remove(&self, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.id == id) {
            waiters.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str) -> PoolKey {
        PoolKey::new("b1", user, "shop")
    }

    #[test]
    fn test_fifo_wake_order_per_key() {
        let q = WaitQueue::new();
        let mut t1 = q.enqueue(key("alice"));
        let mut t2 = q.enqueue(key("alice"));

        assert!(q.wake_for_key(&key("alice")));
        assert_eq!(t1.rx.try_recv(), Ok(()));
        assert!(t2.rx.try_recv().is_err());

        assert!(q.wake_for_key(&key("alice")));
        assert_eq!(t2.rx.try_recv(), Ok(()));
        assert!(q.is_empty());
    }

    #[test]
    fn test_wake_matches_full_key() {
        let q = WaitQueue::new();
        let mut other = q.enqueue(key("bob"));
        let mut target = q.enqueue(key("alice"));

        assert!(q.wake_for_key(&key("alice")));
        assert_eq!(target.rx.try_recv(), Ok(()));
        assert!(other.rx.try_recv().is_err());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_wake_for_backend_ignores_user() {
        let q = WaitQueue::new();
        let mut t = q.enqueue(key("bob"));
        assert!(q.wake_for_backend("b1"));
        assert_eq!(t.rx.try_recv(), Ok(()));
        assert!(!q.wake_for_backend("b1"));
        assert!(!q.wake_for_backend("b2"));
    }

    #[test]
    fn test_at_most_one_wake_per_call() {
        let q = WaitQueue::new();
        let mut t1 = q.enqueue(key("alice"));
        let mut t2 = q.enqueue(key("alice"));
        q.wake_for_key(&key("alice"));
        let woken = [t1.rx.try_recv().is_ok(), t2.rx.try_recv().is_ok()];
        assert_eq!(woken.iter().filter(|w| **w).count(), 1);
    }

    #[test]
    fn test_dead_waiter_is_skipped() {
        let q = WaitQueue::new();
        let t1 = q.enqueue(key("alice"));
        let mut t2 = q.enqueue(key("alice"));
        drop(t1.rx);

        // The wake still lands on a live waiter.
        assert!(q.wake_for_key(&key("alice")));
        assert_eq!(t2.rx.try_recv(), Ok(()));
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_by_ticket_id() {
        let q = WaitQueue::new();
        let t1 = q.enqueue(key("alice"));
        let mut t2 = q.enqueue(key("alice"));
        q.remove(t1.id);
        assert_eq!(q.len(), 1);
        assert!(q.wake_for_key(&key("alice")));
        assert_eq!(t2.rx.try_recv(), Ok(()));
    }

    #[test]
    fn test_wait_timeout_default() {
        assert_eq!(wait_timeout(0), Duration::from_secs(60));
        assert_eq!(wait_timeout(2), Duration::from_secs(2));
    }
}
