//! Observability infrastructure for the engine
//!
//! Provides:
//! - Prometheus metrics (telemetry gauges, throttle level, task and connection counters)
//! - Structured JSON logging of control-plane events with tracing

use crate::health::{Alert, AlertSeverity};
use crate::models::{PerformanceMode, PerformanceProfile, SystemMetrics};
use crate::pool::PoolStats;
use crate::schedule::ThrottleLevel;
use crate::worker::WorkerPoolStats;
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Gauge, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for task durations (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    memory_used_bytes: IntGauge,
    memory_ratio: Gauge,
    cpu_temperature_celsius: Gauge,
    throttle_level: IntGauge,
    mode: IntGaugeVec,
    active_workers: IntGauge,
    queued_tasks: IntGauge,
    tasks_processed: IntCounter,
    task_errors: IntCounter,
    task_duration_seconds: Histogram,
    alerts: IntCounterVec,
    alerts_dropped: IntCounter,
    pressure_reliefs: IntCounter,
    pooled_connections: IntGauge,
    idle_connections: IntGauge,
    host_pools: IntGauge,
    connections_created: IntCounter,
    connections_reused: IntCounter,
    direct_connections: IntCounter,
    pool_exhausted: IntCounter,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            memory_used_bytes: register_int_gauge!(
                "recon_engine_memory_used_bytes",
                "Resident memory of the engine process"
            )
            .expect("Failed to register memory_used_bytes"),

            memory_ratio: register_gauge!(
                "recon_engine_memory_ratio",
                "Resident memory as a fraction of the usable ceiling"
            )
            .expect("Failed to register memory_ratio"),

            cpu_temperature_celsius: register_gauge!(
                "recon_engine_cpu_temperature_celsius",
                "CPU temperature, 0 when no sensor is available"
            )
            .expect("Failed to register cpu_temperature_celsius"),

            throttle_level: register_int_gauge!(
                "recon_engine_throttle_level",
                "Current throttle level in percent"
            )
            .expect("Failed to register throttle_level"),

            mode: register_int_gauge_vec!(
                "recon_engine_mode_info",
                "Currently active performance mode",
                &["mode"]
            )
            .expect("Failed to register mode_info"),

            active_workers: register_int_gauge!(
                "recon_engine_active_workers",
                "Executors currently running in the worker pool"
            )
            .expect("Failed to register active_workers"),

            queued_tasks: register_int_gauge!(
                "recon_engine_queued_tasks",
                "Tasks waiting in the worker pool queue"
            )
            .expect("Failed to register queued_tasks"),

            tasks_processed: register_int_counter!(
                "recon_engine_tasks_processed_total",
                "Total number of task results handled"
            )
            .expect("Failed to register tasks_processed"),

            task_errors: register_int_counter!(
                "recon_engine_task_errors_total",
                "Total number of failed tasks"
            )
            .expect("Failed to register task_errors"),

            task_duration_seconds: register_histogram!(
                "recon_engine_task_duration_seconds",
                "Time spent executing a unit of work",
                TASK_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register task_duration_seconds"),

            alerts: register_int_counter_vec!(
                "recon_engine_alerts_total",
                "Health alerts emitted",
                &["kind", "severity"]
            )
            .expect("Failed to register alerts"),

            alerts_dropped: register_int_counter!(
                "recon_engine_alerts_dropped_total",
                "Alerts dropped because the alert channel was full"
            )
            .expect("Failed to register alerts_dropped"),

            pressure_reliefs: register_int_counter!(
                "recon_engine_pressure_reliefs_total",
                "Memory pressure relief requests"
            )
            .expect("Failed to register pressure_reliefs"),

            pooled_connections: register_int_gauge!(
                "recon_engine_pooled_connections",
                "Live pooled connections counted against the global ceiling"
            )
            .expect("Failed to register pooled_connections"),

            idle_connections: register_int_gauge!(
                "recon_engine_idle_connections",
                "Pooled connections currently idle"
            )
            .expect("Failed to register idle_connections"),

            host_pools: register_int_gauge!(
                "recon_engine_host_pools",
                "Number of per-target host pools"
            )
            .expect("Failed to register host_pools"),

            connections_created: register_int_counter!(
                "recon_engine_connections_created_total",
                "Pooled connections dialed"
            )
            .expect("Failed to register connections_created"),

            connections_reused: register_int_counter!(
                "recon_engine_connections_reused_total",
                "Leases served from an idle pooled connection"
            )
            .expect("Failed to register connections_reused"),

            direct_connections: register_int_counter!(
                "recon_engine_direct_connections_total",
                "Unpooled connections dialed after the host pool cap was reached"
            )
            .expect("Failed to register direct_connections"),

            pool_exhausted: register_int_counter!(
                "recon_engine_pool_exhausted_total",
                "Lease requests refused at the global connection ceiling"
            )
            .expect("Failed to register pool_exhausted"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineMetrics")
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    /// Publish a telemetry snapshot
    pub fn set_system(&self, metrics: &SystemMetrics) {
        let inner = self.inner();
        inner
            .memory_used_bytes
            .set(i64::try_from(metrics.memory_used_bytes).unwrap_or(i64::MAX));
        inner.memory_ratio.set(metrics.memory_percent);
        inner.cpu_temperature_celsius.set(metrics.cpu_temperature_c);
    }

    pub fn set_throttle_level(&self, level: ThrottleLevel) {
        self.inner().throttle_level.set(i64::from(level.percent()));
    }

    /// Mark `mode` as the only active mode
    pub fn set_mode(&self, mode: PerformanceMode) {
        self.inner().mode.reset();
        self.inner().mode.with_label_values(&[&mode.to_string()]).set(1);
    }

    pub fn set_worker_stats(&self, stats: &WorkerPoolStats) {
        self.inner().active_workers.set(stats.active_workers as i64);
        self.inner().queued_tasks.set(stats.queued_tasks as i64);
    }

    /// Record one handled task result
    pub fn observe_task(&self, success: bool, duration_secs: f64) {
        let inner = self.inner();
        inner.tasks_processed.inc();
        if !success {
            inner.task_errors.inc();
        }
        inner.task_duration_seconds.observe(duration_secs);
    }

    pub fn inc_alert(&self, alert: &Alert) {
        self.inner()
            .alerts
            .with_label_values(&[&alert.kind.to_string(), &alert.severity.to_string()])
            .inc();
    }

    pub fn inc_alerts_dropped(&self) {
        self.inner().alerts_dropped.inc();
    }

    pub fn inc_pressure_relief(&self) {
        self.inner().pressure_reliefs.inc();
    }

    pub fn set_pool_stats(&self, stats: &PoolStats) {
        let inner = self.inner();
        inner.pooled_connections.set(stats.live_connections as i64);
        inner.idle_connections.set(stats.idle_connections as i64);
        inner.host_pools.set(stats.host_pools as i64);
    }

    pub fn inc_connections_created(&self) {
        self.inner().connections_created.inc();
    }

    pub fn inc_connections_reused(&self) {
        self.inner().connections_reused.inc();
    }

    pub fn inc_direct_connections(&self) {
        self.inner().direct_connections.inc();
    }

    pub fn inc_pool_exhausted(&self) {
        self.inner().pool_exhausted.inc();
    }
}

/// Structured logger for control-plane events
///
/// Provides consistent JSON-formatted logging for mode changes,
/// throttling, alerts and lifecycle events.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a mode transition with the profile that now applies
    pub fn log_mode_change(
        &self,
        previous: Option<PerformanceMode>,
        current: PerformanceMode,
        profile: &PerformanceProfile,
    ) {
        info!(
            event = "mode_changed",
            instance = %self.instance,
            previous_mode = ?previous,
            mode = %current,
            batch_size = profile.batch_size,
            worker_count = profile.worker_count,
            request_delay_ms = profile.request_delay_ms,
            timeout_ms = profile.timeout_ms,
            max_concurrent_targets = profile.max_concurrent_targets,
            "Performance mode changed"
        );
    }

    /// Log a throttle level change
    pub fn log_throttle_change(
        &self,
        previous: ThrottleLevel,
        current: ThrottleLevel,
        metrics: &SystemMetrics,
    ) {
        let message = if current > previous {
            "Throttle level increased"
        } else {
            "Throttle level decreased"
        };
        info!(
            event = "throttle_changed",
            instance = %self.instance,
            previous_level = previous.percent(),
            level = current.percent(),
            memory_percent = metrics.memory_percent * 100.0,
            cpu_temperature_c = metrics.cpu_temperature_c,
            error_rate = metrics.error_rate(),
            "{}",
            message
        );
    }

    /// Log a processed health alert
    pub fn log_alert(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::Warning => {
                warn!(
                    event = "health_alert",
                    instance = %self.instance,
                    kind = %alert.kind,
                    severity = %alert.severity,
                    message = %alert.message,
                    "Health alert"
                );
            }
            AlertSeverity::Info => {
                info!(
                    event = "health_alert",
                    instance = %self.instance,
                    kind = %alert.kind,
                    severity = %alert.severity,
                    message = %alert.message,
                    "Health alert"
                );
            }
        }
    }

    /// Log the periodic engine report
    pub fn log_report(
        &self,
        mode: PerformanceMode,
        throttle: ThrottleLevel,
        metrics: &SystemMetrics,
        pool: &PoolStats,
        workers: Option<&WorkerPoolStats>,
    ) {
        info!(
            event = "engine_report",
            instance = %self.instance,
            mode = %mode,
            throttle_level = throttle.percent(),
            memory_used_bytes = metrics.memory_used_bytes,
            memory_percent = metrics.memory_percent * 100.0,
            cpu_temperature_c = metrics.cpu_temperature_c,
            error_rate = metrics.error_rate(),
            pooled_connections = pool.live_connections,
            host_pools = pool.host_pools,
            active_workers = workers.map(|w| w.active_workers),
            processed = workers.map(|w| w.processed),
            errors = workers.map(|w| w.errors),
            "Engine report"
        );
    }

    /// Log engine startup
    pub fn log_startup(&self, version: &str, mode: PerformanceMode) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            engine_version = %version,
            mode = %mode,
            "Recon engine started"
        );
    }

    /// Log engine shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Recon engine shutting down"
        );
    }

    /// Log a completed batch phase
    pub fn log_phase_complete(&self, phase: &str, processed: usize, failed: usize, skipped: usize) {
        info!(
            event = "phase_complete",
            instance = %self.instance,
            phase = %phase,
            processed = processed,
            failed = failed,
            skipped = skipped,
            "Batch phase complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::AlertKind;

    #[test]
    fn test_metrics_handles_share_registry() {
        let a = EngineMetrics::new();
        let b = EngineMetrics::new();
        a.set_throttle_level(ThrottleLevel::Heavy);
        b.inc_alert(&Alert::new(AlertKind::Memory, AlertSeverity::Critical, "full"));

        let families = prometheus::gather();
        for name in [
            "recon_engine_throttle_level",
            "recon_engine_alerts_total",
            "recon_engine_memory_ratio",
            "recon_engine_pool_exhausted_total",
        ] {
            assert!(
                families.iter().any(|f| f.get_name() == name),
                "{} not registered",
                name
            );
        }
    }

    #[test]
    fn test_set_mode_labels_active_mode() {
        let metrics = EngineMetrics::new();
        metrics.set_mode(PerformanceMode::FullPower);

        let families = prometheus::gather();
        let mode = families
            .iter()
            .find(|f| f.get_name() == "recon_engine_mode_info")
            .expect("mode gauge registered");
        assert!(mode
            .get_metric()
            .iter()
            .all(|m| m.get_gauge().get_value() == 1.0));
    }
}
