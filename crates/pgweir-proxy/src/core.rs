//! Per-worker proxy state
//!
//! The router, capacity manager, idle cache and wait queue for one worker
//! (or the single process in simple mode). A backend name is owned by
//! exactly one worker, so this state is never shared across workers.

use std::sync::Arc;
use std::time::Duration;

use pgweir_common::config::{BackendEntry, RoutingConfig};
use pgweir_common::Result;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::pool::{CapacityManager, IdleCache, WaitQueue};
use crate::router::Router;

/// How often the reaper sweeps the idle cache for expired connections.
const REAPER_INTERVAL: Duration = Duration::from_secs(10);

pub struct ProxyCore {
    pub router: Router,
    pub capacity: Arc<CapacityManager>,
    pub idle: Arc<IdleCache>,
    pub wait_queue: Arc<WaitQueue>,
}

impl ProxyCore {
    pub fn new(backends: Vec<BackendEntry>, routing: &RoutingConfig) -> Result<Arc<Self>> {
        let capacity = CapacityManager::new(
            backends
                .iter()
                .map(|b| (b.name.clone(), b.effective_pool_size(&routing.defaults))),
        );
        let router = Router::new(backends, routing)?;
        Ok(Arc::new(Self {
            router,
            capacity: Arc::new(capacity),
            idle: Arc::new(IdleCache::new()),
            wait_queue: Arc::new(WaitQueue::new()),
        }))
    }

    /// Periodically close idle connections past their idle timeout or
    /// lifetime, releasing their capacity slots. Without this, expired
    /// sockets for keys no session touches again would linger forever.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                for (key, conn) in core.idle.sweep_expired(Instant::now()) {
                    debug!(
                        "reaper: closing expired idle connection backend={} user={}",
                        key.backend, key.user
                    );
                    drop(conn);
                    core.capacity.release(&key.backend);
                    core.wait_queue.wake_for_backend(&key.backend);
                }
            }
        })
    }
}
