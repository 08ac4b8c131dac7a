//! Connection pool.
//!
//! Connections are keyed by device identity. A checked-out connection is
//! moved out of its device's idle list entirely, so exclusivity holds by
//! construction: no second caller and no sweep can reach it until it is
//! released or evicted. Per-device and global ceilings count idle and
//! checked-out connections alike and are reserved atomically before a dial,
//! so concurrent acquires cannot overshoot them.
//!
//! `sweep` retires idle connections that fail their liveness probe, and live
//! ones that have sat idle longer than twice the configured idle timeout.
//! The probe is evaluated first: a dead connection is closed regardless of
//! age. In-use connections are exempt. The underlying transport is closed
//! before the entry is forgotten so descriptors cannot leak.

use fieldgate_core::config::PoolSettings;
use fieldgate_core::{CapacityError, DeviceConfig, DeviceId, Result};
use fieldgate_protocol::{HandlerRegistry, ProtocolSession};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::EngineMetrics;

/// A connection checked out of the pool. Owned exclusively by the caller
/// until passed back through [`ConnectionPool::release`] or
/// [`ConnectionPool::evict`].
pub struct PooledConnection {
    id: Uuid,
    device_id: DeviceId,
    pub session: Box<dyn ProtocolSession>,
    created_at: Instant,
}

impl PooledConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

struct IdleConnection {
    id: Uuid,
    session: Box<dyn ProtocolSession>,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct DeviceSlot {
    idle: Mutex<Vec<IdleConnection>>,
    /// Idle plus checked-out, counted against the per-device ceiling.
    total: AtomicUsize,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub global_limit: usize,
}

impl PoolStats {
    /// The pool is saturated when no new connection can be opened.
    pub fn saturated(&self) -> bool {
        self.total >= self.global_limit
    }
}

pub struct ConnectionPool {
    slots: DashMap<DeviceId, Arc<DeviceSlot>>,
    handlers: Arc<HandlerRegistry>,
    settings: PoolSettings,
    total: AtomicUsize,
    closed: AtomicBool,
    metrics: Arc<EngineMetrics>,
}

impl ConnectionPool {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        settings: PoolSettings,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            handlers,
            settings,
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Returns an idle, live connection for the device if one exists within
    /// the idle budget, otherwise dials a new one, subject to the per-device
    /// and global ceilings.
    pub async fn acquire(&self, device: &DeviceConfig) -> Result<PooledConnection> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(fieldgate_core::TransportError::NotConnected.into());
        }
        let slot = self
            .slots
            .entry(device.id.clone())
            .or_default()
            .clone();

        // Reuse: newest idle first. Candidates are popped out of the list
        // before any await, so a concurrent sweep can never observe one
        // we are probing.
        loop {
            let candidate = slot.idle.lock().pop();
            let Some(mut conn) = candidate else { break };

            if conn.last_used.elapsed() > self.settings.idle_timeout() {
                self.discard(&slot, conn).await;
                continue;
            }
            if conn.session.probe().await {
                conn.last_used = Instant::now();
                debug!(device_id = %device.id, connection_id = %conn.id, "Reusing pooled connection");
                return Ok(PooledConnection {
                    id: conn.id,
                    device_id: device.id.clone(),
                    session: conn.session,
                    created_at: conn.created_at,
                });
            }
            debug!(device_id = %device.id, connection_id = %conn.id, "Idle connection failed probe");
            self.discard(&slot, conn).await;
        }

        // Dial: reserve capacity first so concurrent acquires cannot
        // overshoot either ceiling.
        let per_device = self.settings.per_device_limit;
        if slot
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < per_device).then_some(n + 1)
            })
            .is_err()
        {
            return Err(CapacityError::DeviceCeiling {
                device_id: device.id.clone(),
                limit: per_device,
            }
            .into());
        }
        let global = self.settings.global_limit;
        if self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < global).then_some(n + 1)
            })
            .is_err()
        {
            slot.total.fetch_sub(1, Ordering::SeqCst);
            return Err(CapacityError::GlobalCeiling { limit: global }.into());
        }

        let handler = match self.handlers.get(device.protocol) {
            Ok(handler) => handler,
            Err(e) => {
                self.unreserve(&slot);
                return Err(e);
            }
        };
        match handler.connect(device).await {
            Ok(session) => {
                let id = Uuid::new_v4();
                self.metrics
                    .record_connection_opened(self.total.load(Ordering::Relaxed));
                info!(device_id = %device.id, connection_id = %id, "Connection opened");
                Ok(PooledConnection {
                    id,
                    device_id: device.id.clone(),
                    session,
                    created_at: Instant::now(),
                })
            }
            Err(e) => {
                self.unreserve(&slot);
                Err(e)
            }
        }
    }

    /// Returns a connection to the idle list for reuse.
    pub async fn release(&self, conn: PooledConnection) {
        if self.closed.load(Ordering::Relaxed) {
            self.evict(conn).await;
            return;
        }
        let Some(slot) = self.slots.get(&conn.device_id).map(|s| s.clone()) else {
            // Device was deregistered while the connection was out.
            self.evict(conn).await;
            return;
        };
        slot.idle.lock().push(IdleConnection {
            id: conn.id,
            session: conn.session,
            created_at: conn.created_at,
            last_used: Instant::now(),
        });
    }

    /// Closes a connection and forgets it.
    pub async fn evict(&self, mut conn: PooledConnection) {
        conn.session.close().await.ok();
        if let Some(slot) = self.slots.get(&conn.device_id).map(|s| s.clone()) {
            self.unreserve(&slot);
        } else {
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.metrics
                .record_connection_closed(self.total.load(Ordering::Relaxed));
        }
        debug!(device_id = %conn.device_id, connection_id = %conn.id, "Connection evicted");
    }

    /// Retires dead and idle-expired connections. Returns how many were
    /// closed.
    pub async fn sweep(&self) -> usize {
        let slots: Vec<(DeviceId, Arc<DeviceSlot>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let stale_after = self.settings.idle_timeout() * 2;
        let mut evicted = 0;

        for (device_id, slot) in slots {
            // Take the idle list out; checked-out connections are not in it.
            let taken: Vec<IdleConnection> = std::mem::take(&mut *slot.idle.lock());
            let mut keep = Vec::with_capacity(taken.len());

            for mut conn in taken {
                let alive = conn.session.probe().await;
                if !alive || conn.last_used.elapsed() > stale_after {
                    debug!(
                        device_id = %device_id,
                        connection_id = %conn.id,
                        alive,
                        "Sweeping connection"
                    );
                    conn.session.close().await.ok();
                    self.unreserve(&slot);
                    evicted += 1;
                } else {
                    keep.push(conn);
                }
            }
            if !keep.is_empty() {
                slot.idle.lock().extend(keep);
            }
        }

        if evicted > 0 {
            info!(evicted, "Pool sweep complete");
        }
        evicted
    }

    /// Closes every idle connection for one device and removes its slot.
    /// Connections currently checked out are counted down when evicted by
    /// their holder.
    pub async fn close_device(&self, device_id: &str) {
        let Some((_, slot)) = self.slots.remove(device_id) else {
            return;
        };
        let taken: Vec<IdleConnection> = std::mem::take(&mut *slot.idle.lock());
        for mut conn in taken {
            conn.session.close().await.ok();
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.metrics
                .record_connection_closed(self.total.load(Ordering::Relaxed));
        }
    }

    /// Closes all pooled connections and refuses further acquires.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let device_ids: Vec<DeviceId> =
            self.slots.iter().map(|entry| entry.key().clone()).collect();
        for device_id in device_ids {
            self.close_device(&device_id).await;
        }
        info!("Connection pool closed");
    }

    /// Resolves the handler a device's protocol kind would use. Lets the
    /// engine reject unknown kinds at registration time.
    pub fn handler_for(
        &self,
        kind: fieldgate_core::ProtocolKind,
    ) -> Result<Arc<dyn fieldgate_protocol::ProtocolHandler>> {
        self.handlers.get(kind)
    }

    pub fn stats(&self) -> PoolStats {
        let idle: usize = self.slots.iter().map(|entry| entry.idle.lock().len()).sum();
        let total = self.total.load(Ordering::Relaxed);
        PoolStats {
            total,
            idle,
            in_use: total.saturating_sub(idle),
            global_limit: self.settings.global_limit,
        }
    }

    async fn discard(&self, slot: &Arc<DeviceSlot>, mut conn: IdleConnection) {
        conn.session.close().await.ok();
        self.unreserve(slot);
    }

    fn unreserve(&self, slot: &Arc<DeviceSlot>) {
        slot.total.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.metrics
            .record_connection_closed(self.total.load(Ordering::Relaxed));
    }

    /// Spawns the periodic background sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.settings.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep().await;
                    }
                }
            }
        })
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) && self.total.load(Ordering::Relaxed) > 0 {
            warn!("Connection pool dropped with open connections");
        }
    }
}
