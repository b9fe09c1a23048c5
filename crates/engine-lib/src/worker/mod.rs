//! Task execution
//!
//! This module provides:
//! - Task and result types plus the unit-of-work and sink contracts (`task`)
//! - The dynamically sized `WorkerPool` (`pool`)
//! - The join-on-batch `BatchRunner` (`batch`)
//! - Default DNS and TCP banner units of work (`probe`)

mod batch;
mod pool;
mod probe;
mod task;


pub use batch::{item_key, BatchRunner, PhaseSummary};
pub use pool::WorkerPool;
pub use probe::{DnsLookup, TcpBannerProbe};
pub use task::{result_key, JsonLinesSink, MemorySink, ResultSink, Task, TaskResult, UnitOfWork};

use serde::{Deserialize, Serialize};

/// Point-in-time worker pool readout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub active_workers: usize,
    pub queued_tasks: usize,
    /// Results handled, successful or not
    pub processed: u64,
    pub errors: u64,
}
