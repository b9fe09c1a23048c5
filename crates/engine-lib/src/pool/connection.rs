//! Pooled TCP connections

use crate::error::{EngineError, EngineResult};
use socket2::{SockRef, TcpKeepalive};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Holds one unit of the global connection ceiling; released on drop
#[derive(Debug)]
pub(crate) struct Slot {
    live: Arc<AtomicUsize>,
}

impl Slot {
    /// Reserve a slot if fewer than `limit` are held
    pub(crate) fn reserve(live: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < limit).then_some(current + 1)
        })
        .ok()
        .map(|_| Self {
            live: Arc::clone(live),
        })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A leased connection. Dropping it closes the socket.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    host: String,
    port: u16,
    created_at: Instant,
    last_used: Instant,
    use_count: u32,
    /// Present for pooled connections, absent for direct ones
    slot: Option<Slot>,
}

impl PooledConnection {
    pub(crate) fn new(stream: TcpStream, host: &str, port: u16, slot: Option<Slot>) -> Self {
        let now = Instant::now();
        Self {
            stream,
            host: host.to_string(),
            port,
            created_at: now,
            last_used: now,
            use_count: 1,
            slot,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host pool key, `host:port`
    pub fn target(&self) -> String {
        target_key(&self.host, self.port)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// True when the connection counts against the global ceiling
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    pub(crate) fn mark_reused(&mut self) {
        self.use_count += 1;
        self.last_used = Instant::now();
    }

    pub(crate) fn mark_returned(&mut self) {
        self.last_used = Instant::now();
    }

    /// Reusable while younger than `max_age` and below `usage_ceiling` leases
    pub(crate) fn is_reusable(&self, max_age: Duration, usage_ceiling: u32) -> bool {
        self.age() < max_age && self.use_count < usage_ceiling
    }
}

pub(crate) fn target_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Dial `host:port` within `timeout`, enabling TCP keep-alive
pub(crate) async fn dial(
    host: &str,
    port: u16,
    timeout: Duration,
    keep_alive: Duration,
) -> EngineResult<TcpStream> {
    let target = target_key(host, port);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(EngineError::Dial { target, source }),
        Err(_) => return Err(EngineError::Timeout { target, timeout }),
    };

    if !keep_alive.is_zero() {
        let keepalive = TcpKeepalive::new().with_time(keep_alive);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(target = %target, error = %e, "Failed to enable TCP keep-alive");
        }
    }
    let _ = stream.set_nodelay(true);

    Ok(stream)
}
