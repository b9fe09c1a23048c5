//! Data models for the engine control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operating mode of the engine. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    /// Daytime operation with minimal footprint
    Conservation,
    /// Inside the configured night window
    FullPower,
    /// Explicitly enabled sustained high-concurrency operation
    HighPerformance,
}

impl std::fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerformanceMode::Conservation => write!(f, "conservation"),
            PerformanceMode::FullPower => write!(f, "full_power"),
            PerformanceMode::HighPerformance => write!(f, "high_performance"),
        }
    }
}

/// Tunables selected per mode. Profiles are chosen, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceProfile {
    /// Items per batch before adaptive scaling
    pub batch_size: usize,
    /// Concurrent operations allowed in flight
    pub worker_count: usize,
    /// Pause applied before each unit of work
    pub request_delay_ms: u64,
    /// Per-operation network timeout
    pub timeout_ms: u64,
    /// Maximum number of targets processed concurrently
    pub max_concurrent_targets: usize,
    /// Lower bound for adaptive batch sizing
    pub min_batch: usize,
    /// Upper bound for adaptive batch sizing
    pub max_batch: usize,
    /// Scale batches with memory pressure
    pub memory_aware: bool,
    /// Scale batches with CPU temperature
    pub thermal_aware: bool,
}

impl PerformanceProfile {
    /// Night-window profile: large batches, three workers per core
    pub fn full_power(cores: usize) -> Self {
        Self {
            batch_size: 5000,
            worker_count: cores.max(1) * 3,
            request_delay_ms: 5,
            timeout_ms: 8_000,
            max_concurrent_targets: 200,
            ..Self::default()
        }
    }

    /// Daytime profile: small batches, half the cores
    pub fn conservation(cores: usize) -> Self {
        Self {
            batch_size: 500,
            worker_count: (cores / 2).max(1),
            request_delay_ms: 100,
            timeout_ms: 3_000,
            max_concurrent_targets: 10,
            ..Self::default()
        }
    }

    /// Sustained high-concurrency profile
    pub fn high_performance() -> Self {
        Self {
            batch_size: 2000,
            worker_count: 800,
            request_delay_ms: 1,
            timeout_ms: 10_000,
            max_concurrent_targets: 800,
            ..Self::default()
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            worker_count: 4,
            request_delay_ms: 10,
            timeout_ms: 5_000,
            max_concurrent_targets: 50,
            min_batch: 100,
            max_batch: 5000,
            memory_aware: true,
            thermal_aware: true,
        }
    }
}

/// Latest telemetry snapshot. Written only by the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// CPU temperature in degrees Celsius, 0 when no sensor is available
    pub cpu_temperature_c: f64,
    /// Resident memory of the process in bytes
    pub memory_used_bytes: u64,
    /// Resident memory as a fraction of the usable ceiling (0.0 - 1.0)
    pub memory_percent: f64,
    /// Executors currently running
    pub live_workers: usize,
    pub success_count: u64,
    pub error_count: u64,
    /// Time of the last completed sample
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<DateTime<Utc>>,
}

impl SystemMetrics {
    /// Fraction of failed operations since the counters were last halved
    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }
}

/// Position reached by a batch phase, recorded after each completed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub batch_index: usize,
    /// Index of the first item not yet covered by a completed batch
    pub item_index: usize,
    pub completed_at: DateTime<Utc>,
}

impl Progress {
    pub fn new(phase: impl Into<String>, batch_index: usize, item_index: usize) -> Self {
        Self {
            phase: phase.into(),
            batch_index,
            item_index,
            completed_at: Utc::now(),
        }
    }
}

/// Number of logical cores, 1 when it cannot be determined
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
