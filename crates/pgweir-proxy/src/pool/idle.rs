//! Idle backend connection cache
//!
//! Keyed by (backend, user, database); each key holds a LIFO stack of open
//! backend sockets together with the cached startup response that the next
//! client of the same key gets replayed. Timestamps use `tokio::time::
//! Instant` so expiry is testable under the paused clock.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::PoolKey;

/// An idle backend connection parked for reuse. Owns the socket; nothing
/// reads from it while parked.
#[derive(Debug)]
pub struct IdleConnection {
    pub stream: TcpStream,
    /// Backend reply to the original StartupMessage, through the first
    /// ReadyForQuery. Replayed to the next client of this key.
    pub startup_response: Bytes,
    pub idle_since: Instant,
    /// First establishment time; preserved across reuses for lifetime
    /// eviction.
    pub created_at: Instant,
    /// Timeouts recorded at put time so the reaper can judge expiry without
    /// a config lookup.
    idle_timeout_sec: u32,
    lifetime_sec: u32,
}

fn is_expired(conn: &IdleConnection, now: Instant, idle_timeout_sec: u32, lifetime_sec: u32) -> bool {
    if idle_timeout_sec > 0 && now.duration_since(conn.idle_since).as_secs() >= u64::from(idle_timeout_sec) {
        return true;
    }
    if lifetime_sec > 0 && now.duration_since(conn.created_at).as_secs() >= u64::from(lifetime_sec) {
        return true;
    }
    false
}

/// Idle-connection cache, one mutex over the map and all stacks.
#[derive(Debug, Default)]
pub struct IdleCache {
    idle: Mutex<HashMap<PoolKey, Vec<IdleConnection>>>,
}

impl IdleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a connection for reuse. `idle_since` restarts now; `created_at`
    /// is carried from first establishment. Waking a waiter on the key is
    /// the caller's job, right after this returns.
    pub fn put(
        &self,
        key: PoolKey,
        stream: TcpStream,
        startup_response: Bytes,
        created_at: Instant,
        idle_timeout_sec: u32,
        lifetime_sec: u32,
    ) {
        let conn = IdleConnection {
            stream,
            startup_response,
            idle_since: Instant::now(),
            created_at,
            idle_timeout_sec,
            lifetime_sec,
        };
        self.idle.lock().entry(key).or_default().push(conn);
    }

    /// Take the newest non-expired connection for the key. Expired entries
    /// are skipped, not returned; drain them with `take_one_expired`. With
    /// both timeouts zero nothing ever expires and the top entry is returned
    /// unconditionally.
    pub fn take(
        &self,
        key: &PoolKey,
        now: Instant,
        idle_timeout_sec: u32,
        lifetime_sec: u32,
    ) -> Option<IdleConnection> {
        let mut idle = self.idle.lock();
        let stack = idle.get_mut(key)?;
        let pos = if idle_timeout_sec == 0 && lifetime_sec == 0 {
            stack.len().checked_sub(1)
        } else {
            stack
                .iter()
                .rposition(|c| !is_expired(c, now, idle_timeout_sec, lifetime_sec))
        };
        let conn = pos.map(|i| stack.remove(i));
        if stack.is_empty() {
            idle.remove(key);
        }
        conn
    }

    /// Remove and return one expired connection for the key, if any. The
    /// caller closes the socket and releases the capacity slot.
    pub fn take_one_expired(
        &self,
        key: &PoolKey,
        now: Instant,
        idle_timeout_sec: u32,
        lifetime_sec: u32,
    ) -> Option<IdleConnection> {
        if idle_timeout_sec == 0 && lifetime_sec == 0 {
            return None;
        }
        let mut idle = self.idle.lock();
        let stack = idle.get_mut(key)?;
        let pos = stack
            .iter()
            .position(|c| is_expired(c, now, idle_timeout_sec, lifetime_sec));
        let conn = pos.map(|i| stack.remove(i));
        if stack.is_empty() {
            idle.remove(key);
        }
        conn
    }

    /// Unconditional pop for hard shutdown paths.
    pub fn take_one_to_close(&self, key: &PoolKey) -> Option<IdleConnection> {
        let mut idle = self.idle.lock();
        let stack = idle.get_mut(key)?;
        let conn = stack.pop();
        if stack.is_empty() {
            idle.remove(key);
        }
        conn
    }

    /// Remove every expired entry across all keys, judged by the timeouts
    /// recorded at put time. The reaper closes the sockets and releases the
    /// capacity slots.
    pub fn sweep_expired(&self, now: Instant) -> Vec<(PoolKey, IdleConnection)> {
        let mut idle = self.idle.lock();
        let mut out = Vec::new();
        idle.retain(|key, stack| {
            let mut i = 0;
            while i < stack.len() {
                if is_expired(&stack[i], now, stack[i].idle_timeout_sec, stack[i].lifetime_sec) {
                    out.push((key.clone(), stack.remove(i)));
                } else {
                    i += 1;
                }
            }
            !stack.is_empty()
        });
        out
    }

    /// Number of parked connections for a key.
    pub fn len(&self, key: &PoolKey) -> usize {
        self.idle.lock().get(key).map_or(0, Vec::len)
    }
}
