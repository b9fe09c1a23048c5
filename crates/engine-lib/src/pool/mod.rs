//! Connection pool
//!
//! Multiplexes a bounded number of live TCP connections across many targets:
//! - one bounded idle queue per `host:port`, created on demand
//! - a global ceiling on pooled connections, enforced by atomic reservation
//! - direct unpooled connections once the host-pool directory is full
//! - periodic eviction of stale connections and idle host pools

mod connection;
mod host;

#[cfg(test)]
mod tests;

pub use connection::PooledConnection;

use crate::config::PoolConfig;
use crate::error::{EngineError, EngineResult};
use crate::health::PressureRelief;
use crate::observability::EngineMetrics;
use connection::{dial, target_key, Slot};
use dashmap::DashMap;
use host::HostPool;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Point-in-time pool readout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub host_pools: usize,
    pub max_host_pools: usize,
    /// Pooled connections alive, leased or idle
    pub live_connections: usize,
    pub idle_connections: usize,
    pub max_connections: usize,
    pub created: u64,
    pub reused: u64,
    pub direct: u64,
    pub exhausted: u64,
    pub evicted: u64,
}

/// Result of one cleanup sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted_connections: usize,
    pub evicted_pools: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    direct: AtomicU64,
    exhausted: AtomicU64,
    evicted: AtomicU64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    hosts: DashMap<String, Arc<HostPool>>,
    /// Serializes host-pool creation only; lookups never take it
    creation: Mutex<()>,
    max_host_pools: usize,
    live: Arc<AtomicUsize>,
    counters: PoolCounters,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
    metrics: EngineMetrics,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let max_host_pools = config.max_host_pools();

        Self {
            config,
            hosts: DashMap::new(),
            creation: Mutex::new(()),
            max_host_pools,
            live: Arc::new(AtomicUsize::new(0)),
            counters: PoolCounters::default(),
            closed: AtomicBool::new(false),
            shutdown,
            cleanup_handle: Mutex::new(None),
            metrics: EngineMetrics::new(),
        }
    }

    /// Spawn the periodic cleanup loop
    pub fn start(self: &Arc<Self>) {
        let mut handle = self
            .cleanup_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        info!(
            max_connections = self.config.max_connections,
            per_host_limit = self.config.per_host_limit,
            max_host_pools = self.max_host_pools,
            cleanup_interval_secs = self.config.cleanup_interval().as_secs(),
            "Starting connection pool"
        );

        let pool = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            pool.run_cleanup(shutdown).await;
        }));
    }

    async fn run_cleanup(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.cleanup_interval());
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.cleanup();
                    if report.evicted_connections > 0 || report.evicted_pools > 0 {
                        debug!(
                            evicted_connections = report.evicted_connections,
                            evicted_pools = report.evicted_pools,
                            "Connection pool cleanup"
                        );
                    }
                    self.metrics.set_pool_stats(&self.stats());
                }
                _ = shutdown.recv() => {
                    info!("Shutting down connection pool cleanup loop");
                    break;
                }
            }
        }
    }

    /// Lease a connection to `host:port`
    pub async fn get_connection(&self, host: &str, port: u16) -> EngineResult<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::PoolClosed);
        }

        let key = target_key(host, port);
        let Some(host_pool) = self.host_pool(&key) else {
            self.counters.direct.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_direct_connections();
            debug!(target = %key, "Host pool limit reached, dialing directly");
            let stream = dial(
                host,
                port,
                self.config.connect_timeout(),
                self.config.keep_alive(),
            )
            .await?;
            return Ok(PooledConnection::new(stream, host, port, None));
        };

        host_pool.touch();

        let max_age = self.config.max_idle_age();
        while let Some(mut conn) = host_pool.pop() {
            if conn.is_reusable(max_age, self.config.usage_ceiling) {
                conn.mark_reused();
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_connections_reused();
                return Ok(conn);
            }
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(
                target = %key,
                age_ms = conn.age().as_millis() as u64,
                use_count = conn.use_count(),
                "Closing stale pooled connection"
            );
        }

        let slot = Slot::reserve(&self.live, self.config.max_connections).ok_or_else(|| {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_pool_exhausted();
            EngineError::PoolExhausted {
                limit: self.config.max_connections,
            }
        })?;

        let stream = dial(
            host,
            port,
            self.config.connect_timeout(),
            self.config.keep_alive(),
        )
        .await?;

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_connections_created();
        Ok(PooledConnection::new(stream, host, port, Some(slot)))
    }

    /// Existing or newly created host pool; `None` once the directory is full
    fn host_pool(&self, key: &str) -> Option<Arc<HostPool>> {
        if let Some(pool) = self.hosts.get(key) {
            return Some(Arc::clone(pool.value()));
        }

        let _guard = self.creation.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = self.hosts.get(key) {
            return Some(Arc::clone(pool.value()));
        }
        if self.hosts.len() >= self.max_host_pools {
            return None;
        }

        let pool = Arc::new(HostPool::new(self.config.per_host_limit));
        self.hosts.insert(key.to_string(), Arc::clone(&pool));
        Some(pool)
    }

    /// Give a leased connection back. Invalid or surplus connections are closed.
    pub fn return_connection(&self, mut conn: PooledConnection) {
        if !conn.is_pooled() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        if !conn.is_reusable(self.config.max_idle_age(), self.config.usage_ceiling) {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key = conn.target();
        let Some(host_pool) = self.hosts.get(&key).map(|p| Arc::clone(p.value())) else {
            return;
        };

        conn.mark_returned();
        if host_pool.push(conn).is_err() {
            debug!(target = %key, "Host pool full, closing returned connection");
        }
    }

    /// Evict stale connections and host pools idle for longer than twice the keep-alive
    pub fn cleanup(&self) -> CleanupReport {
        let max_age = self.config.max_idle_age();
        let pools: Vec<(String, Arc<HostPool>)> = self
            .hosts
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = CleanupReport::default();
        let mut stale = Vec::new();

        for (key, pool) in pools {
            if pool.idle_for() > max_age {
                if self
                    .hosts
                    .remove_if(&key, |_, p| p.idle_for() > max_age)
                    .is_some()
                {
                    report.evicted_pools += 1;
                    stale.extend(pool.drain());
                }
                continue;
            }
            stale.extend(pool.evict_stale(max_age, self.config.usage_ceiling));
        }

        report.evicted_connections = stale.len();
        self.counters
            .evicted
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        // Sockets close here, after every lock is released
        drop(stale);
        report
    }

    /// Close every idle connection, keeping the host pools
    pub fn shed_idle(&self) -> usize {
        let pools: Vec<Arc<HostPool>> = self
            .hosts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let idle: Vec<PooledConnection> = pools.iter().flat_map(|pool| pool.drain()).collect();
        let count = idle.len();
        drop(idle);
        count
    }

    /// Stop the cleanup loop and close every idle connection
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());

        let closed = self.shed_idle();
        self.hosts.clear();
        info!(closed_connections = closed, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let idle_connections = self.hosts.iter().map(|entry| entry.value().len()).sum();

        PoolStats {
            host_pools: self.hosts.len(),
            max_host_pools: self.max_host_pools,
            live_connections: self.live.load(Ordering::Acquire),
            idle_connections,
            max_connections: self.config.max_connections,
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            direct: self.counters.direct.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

impl PressureRelief for ConnectionPool {
    fn name(&self) -> &str {
        "connection-pool"
    }

    fn relieve(&self) -> usize {
        let shed = self.shed_idle();
        if shed > 0 {
            warn!(closed_connections = shed, "Closed idle pooled connections under memory pressure");
        }
        shed
    }
}
