//! Health monitoring for the engine
//!
//! This module provides:
//! - Telemetry sampling from procfs/sysfs (`sampler`)
//! - Leveled health alerts with a bounded history (`alerts`)
//! - The periodic `HealthMonitor` and its derived recommendations (`monitor`)

mod alerts;
mod monitor;
mod sampler;


pub use alerts::{Alert, AlertHistory, AlertKind, AlertSeverity};
pub use monitor::{scaled_batch_size, HealthMonitor, PressureRelief};
pub use sampler::{MetricsSampler, ProcSampler, StaticSampler};

use crate::models::SystemMetrics;
use serde::{Deserialize, Serialize};

/// Overall health of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every reading is below its warning threshold
    Healthy,
    /// At least one reading is above its warning threshold
    Degraded,
    /// At least one reading is above its critical threshold
    Unhealthy,
}

impl HealthStatus {
    /// Returns true if the engine is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Point-in-time health readout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub metrics: SystemMetrics,
    /// Error rate over the live counters
    pub error_rate: f64,
    pub recent_alerts: Vec<Alert>,
    pub dropped_alerts: u64,
}
