//! Engine configuration
//!
//! Every section deserializes with defaults so a partial file or a handful of
//! environment overrides is enough. `EngineConfig::validate` rejects values
//! that would make the control loops misbehave.

use crate::error::{EngineError, EngineResult};
use crate::models::{available_cores, PerformanceProfile};
use crate::schedule::DailyWindow;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub profiles: ProfilesConfig,
    pub thresholds: ThresholdConfig,
    pub monitor: MonitorConfig,
    pub pool: PoolConfig,
    pub workers: WorkerPoolConfig,
    pub batch: BatchConfig,
}

impl EngineConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> EngineResult<()> {
        self.schedule.full_power_window()?;
        self.schedule.high_performance_window()?;

        let t = &self.thresholds;
        if !(0.0 < t.memory_warn && t.memory_warn <= t.memory_critical
            && t.memory_critical <= t.memory_emergency
            && t.memory_emergency <= 1.0)
        {
            return Err(EngineError::Config(
                "memory thresholds must satisfy 0 < warn <= critical <= emergency <= 1".into(),
            ));
        }
        if t.thermal_warn_c > t.thermal_critical_c {
            return Err(EngineError::Config(
                "thermal warn threshold exceeds critical threshold".into(),
            ));
        }
        if t.error_rate_warn > t.error_rate_critical {
            return Err(EngineError::Config(
                "error rate warn threshold exceeds critical threshold".into(),
            ));
        }

        if self.pool.per_host_limit == 0 || self.pool.max_connections < self.pool.per_host_limit {
            return Err(EngineError::Config(
                "pool.max_connections must be at least pool.per_host_limit (> 0)".into(),
            ));
        }
        if self.pool.usage_ceiling == 0 {
            return Err(EngineError::Config("pool.usage_ceiling must be > 0".into()));
        }

        let w = &self.workers;
        if w.min_workers == 0 || w.min_workers > w.max_workers {
            return Err(EngineError::Config(
                "workers must satisfy 0 < min_workers <= max_workers".into(),
            ));
        }
        if w.scale_step == 0 {
            return Err(EngineError::Config("workers.scale_step must be > 0".into()));
        }

        for (name, profile) in [
            ("conservation", &self.profiles.conservation),
            ("full_power", &self.profiles.full_power),
            ("high_performance", &self.profiles.high_performance),
        ] {
            if profile.min_batch == 0 || profile.min_batch > profile.max_batch {
                return Err(EngineError::Config(format!(
                    "profile {name}: batch bounds must satisfy 0 < min_batch <= max_batch"
                )));
            }
        }

        if self.monitor.alert_channel_capacity == 0 {
            return Err(EngineError::Config(
                "monitor.alert_channel_capacity must be > 0".into(),
            ));
        }

        Ok(())
    }
}

/// Time-of-day policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Offset of local wall-clock time from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// Start of the full-power window, "HH:MM"
    pub full_power_start: String,
    /// End of the full-power window, "HH:MM". May be earlier than the start.
    pub full_power_end: String,
    /// Enables high-performance mode
    pub high_performance_enabled: bool,
    /// Optional window restricting high-performance mode
    pub high_performance_start: Option<String>,
    pub high_performance_end: Option<String>,
}

impl ScheduleConfig {
    pub fn full_power_window(&self) -> EngineResult<DailyWindow> {
        DailyWindow::parse(&self.full_power_start, &self.full_power_end)
    }

    pub fn high_performance_window(&self) -> EngineResult<Option<DailyWindow>> {
        match (&self.high_performance_start, &self.high_performance_end) {
            (Some(start), Some(end)) => DailyWindow::parse(start, end).map(Some),
            (None, None) => Ok(None),
            _ => Err(EngineError::Config(
                "high_performance_start and high_performance_end must be set together".into(),
            )),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            full_power_start: "01:37".to_string(),
            full_power_end: "06:30".to_string(),
            high_performance_enabled: false,
            high_performance_start: None,
            high_performance_end: None,
        }
    }
}

/// Profile selected for each mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    pub conservation: PerformanceProfile,
    pub full_power: PerformanceProfile,
    pub high_performance: PerformanceProfile,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        let cores = available_cores();
        Self {
            conservation: PerformanceProfile::conservation(cores),
            full_power: PerformanceProfile::full_power(cores),
            high_performance: PerformanceProfile::high_performance(),
        }
    }
}

/// Health thresholds shared by alerting, throttling and worker sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Memory fraction raising a warning alert
    pub memory_warn: f64,
    /// Memory pressure threshold: critical alert, throttling, halved workers
    pub memory_critical: f64,
    /// Memory fraction where heavy throttling and the worker floor apply
    pub memory_emergency: f64,
    pub thermal_warn_c: f64,
    pub thermal_critical_c: f64,
    pub error_rate_warn: f64,
    pub error_rate_critical: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            memory_warn: 0.70,
            memory_critical: 0.80,
            memory_emergency: 0.90,
            thermal_warn_c: 60.0,
            thermal_critical_c: 70.0,
            error_rate_warn: 0.02,
            error_rate_critical: 0.05,
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling and throttle recomputation interval in seconds
    pub health_check_interval_secs: u64,
    /// Usable memory ceiling the resident size is measured against
    pub max_memory_bytes: u64,
    pub alert_channel_capacity: usize,
    pub alert_history_limit: usize,
    /// Success + error count above which both counters are halved
    pub counter_halving_threshold: u64,
}

impl MonitorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 10,
            max_memory_bytes: 6 * 1024 * 1024 * 1024,
            alert_channel_capacity: 100,
            alert_history_limit: 100,
            counter_halving_threshold: 10_000,
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Global ceiling on live pooled connections
    pub max_connections: usize,
    /// Idle connections kept per target
    pub per_host_limit: usize,
    pub keep_alive_ms: u64,
    pub connect_timeout_ms: u64,
    /// Number of leases after which a connection is retired
    pub usage_ceiling: u32,
    pub cleanup_interval_secs: u64,
}

impl PoolConfig {
    /// Host pools allowed before targets fall back to direct connections
    pub fn max_host_pools(&self) -> usize {
        self.max_connections / self.per_host_limit.max(1)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Connections and host pools older or idler than this are evicted
    pub fn max_idle_age(&self) -> Duration {
        self.keep_alive().saturating_mul(2)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            per_host_limit: 5,
            keep_alive_ms: 60_000,
            connect_timeout_ms: 10_000,
            usage_ceiling: 100,
            cleanup_interval_secs: 300,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Maximum executors added or removed per scale tick
    pub scale_step: usize,
    pub scale_interval_secs: u64,
    pub result_buffer: usize,
    /// Base per-task delay handed to the scheduler
    pub base_delay_ms: u64,
    /// Delay multiplier while the monitor reports throttling
    pub throttle_delay_multiplier: u32,
}

impl WorkerPoolConfig {
    /// Task queue capacity, twice the executor ceiling
    pub fn queue_capacity(&self) -> usize {
        (self.max_workers * 2).max(1)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs(self.scale_interval_secs.max(1))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 50,
            max_workers: 800,
            scale_step: 25,
            scale_interval_secs: 30,
            result_buffer: 1000,
            base_delay_ms: 1,
            throttle_delay_multiplier: 10,
        }
    }
}

/// Batch phase settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pause between batches while the scheduler throttles
    pub throttle_pause_ms: u64,
    /// Longest wait for the next full-power window before starting anyway
    pub max_wait_for_full_power_secs: u64,
}

impl BatchConfig {
    pub fn throttle_pause(&self) -> Duration {
        Duration::from_millis(self.throttle_pause_ms)
    }

    pub fn max_wait_for_full_power(&self) -> Duration {
        Duration::from_secs(self.max_wait_for_full_power_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            throttle_pause_ms: 2_000,
            max_wait_for_full_power_secs: 2 * 60 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.max_host_pools(), 200);
        assert_eq!(config.workers.queue_capacity(), 1600);
        assert_eq!(config.monitor.max_memory_bytes, 6 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"pool": {"max_connections": 40}, "schedule": {"high_performance_enabled": true}}"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_connections, 40);
        assert_eq!(config.pool.per_host_limit, 5);
        assert!(config.schedule.high_performance_enabled);
        assert_eq!(config.schedule.full_power_start, "01:37");
        assert_eq!(config.workers.scale_step, 25);
    }

    #[test]
    fn test_rejects_inverted_worker_bounds() {
        let mut config = EngineConfig::default();
        config.workers.min_workers = 900;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_window() {
        let mut config = EngineConfig::default();
        config.schedule.full_power_start = "25:00".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.schedule.high_performance_start = Some("08:00".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unordered_memory_thresholds() {
        let mut config = EngineConfig::default();
        config.thresholds.memory_warn = 0.95;
        assert!(config.validate().is_err());
    }
}
