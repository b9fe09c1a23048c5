//! Per-target idle connection queue

use super::connection::PooledConnection;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Bounded idle queue for one `host:port`. Never blocks the caller.
#[derive(Debug)]
pub(crate) struct HostPool {
    idle: Mutex<VecDeque<PooledConnection>>,
    capacity: usize,
    last_used: Mutex<Instant>,
}

impl HostPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub(crate) fn pop(&self) -> Option<PooledConnection> {
        self.idle().pop_front()
    }

    /// Queue a connection, handing it back when the queue is full
    pub(crate) fn push(&self, conn: PooledConnection) -> Result<(), PooledConnection> {
        let mut idle = self.idle();
        if idle.len() >= self.capacity {
            return Err(conn);
        }
        idle.push_back(conn);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.idle().len()
    }

    /// Remove every idle connection. The caller closes them outside the lock.
    pub(crate) fn drain(&self) -> Vec<PooledConnection> {
        self.idle().drain(..).collect()
    }

    /// Remove connections that may no longer be reused
    pub(crate) fn evict_stale(&self, max_age: Duration, usage_ceiling: u32) -> Vec<PooledConnection> {
        let mut idle = self.idle();
        let (keep, stale): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|conn| conn.is_reusable(max_age, usage_ceiling));
        *idle = VecDeque::from(keep);
        stale
    }
}
