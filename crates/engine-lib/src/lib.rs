//! Engine library for resource-aware network reconnaissance
//!
//! This crate provides the concurrency control plane:
//! - Health sampling, alerting and load recommendations
//! - Time-of-day performance modes and the throttle ladder
//! - A bounded TCP connection pool shared across targets
//! - A dynamically sized worker pool and a batch phase driver
//! - Metrics and structured logging

pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod pool;
pub mod schedule;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use health::{HealthMonitor, HealthReport, HealthStatus, PressureRelief};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use pool::{ConnectionPool, PoolStats};
pub use schedule::{Scheduler, ThrottleLevel};
pub use worker::{BatchRunner, WorkerPool, WorkerPoolStats};
