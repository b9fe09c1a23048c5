//! Health monitor
//!
//! Owns the telemetry snapshot and the alert pipeline:
//! - a sampling loop refreshing `SystemMetrics` every health-check interval
//! - an alert loop draining the bounded alert channel into the history
//! - derived queries used by the scheduler and the worker pool

use super::alerts::{Alert, AlertHistory, AlertKind, AlertSeverity};
use super::sampler::MetricsSampler;
use super::{HealthReport, HealthStatus};
use crate::config::{MonitorConfig, ThresholdConfig};
use crate::models::{PerformanceProfile, SystemMetrics};
use crate::observability::{EngineMetrics, StructuredLogger};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Memory fraction above which batches are halved
const BATCH_MEMORY_HIGH: f64 = 0.7;
/// Memory fraction below which batches grow
const BATCH_MEMORY_LOW: f64 = 0.3;
/// Temperature above which batches shrink
const BATCH_THERMAL_HIGH_C: f64 = 70.0;
/// Temperature below which batches grow
const BATCH_THERMAL_LOW_C: f64 = 50.0;

/// Something that can release memory when the monitor sees critical pressure
pub trait PressureRelief: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released, returning the number of items freed
    fn relieve(&self) -> usize;
}

/// Periodic health sampler and alert processor
pub struct HealthMonitor {
    config: MonitorConfig,
    thresholds: ThresholdConfig,
    sampler: Arc<dyn MetricsSampler>,
    snapshot: RwLock<SystemMetrics>,
    history: Mutex<AlertHistory>,
    alert_tx: mpsc::Sender<Alert>,
    alert_rx: Mutex<Option<mpsc::Receiver<Alert>>>,
    successes: AtomicU64,
    errors: AtomicU64,
    dropped_alerts: AtomicU64,
    live_workers: Arc<AtomicUsize>,
    reliefs: RwLock<Vec<Arc<dyn PressureRelief>>>,
    memory_failure_logged: AtomicBool,
    temperature_failure_logged: AtomicBool,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(
        config: MonitorConfig,
        thresholds: ThresholdConfig,
        sampler: Arc<dyn MetricsSampler>,
    ) -> Self {
        let (alert_tx, alert_rx) = mpsc::channel(config.alert_channel_capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);
        let history = AlertHistory::new(config.alert_history_limit);

        Self {
            config,
            thresholds,
            sampler,
            snapshot: RwLock::new(SystemMetrics::default()),
            history: Mutex::new(history),
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped_alerts: AtomicU64::new(0),
            live_workers: Arc::new(AtomicUsize::new(0)),
            reliefs: RwLock::new(Vec::new()),
            memory_failure_logged: AtomicBool::new(false),
            temperature_failure_logged: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("health-monitor"),
        }
    }

    /// Spawn the sampling and alert loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            warn!("Health monitor already started or stopped");
            return;
        }

        info!(
            interval_secs = self.config.health_check_interval().as_secs(),
            max_memory_bytes = self.config.max_memory_bytes,
            "Starting health monitor"
        );

        let mut handles = Vec::with_capacity(2);

        let monitor = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            monitor.run_sampling(shutdown).await;
        }));

        if let Some(alert_rx) = lock(&self.alert_rx).take() {
            let monitor = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                monitor.run_alerts(alert_rx, shutdown).await;
            }));
        }

        lock(&self.handles).extend(handles);
    }

    /// Signal the background loops to exit. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        info!("Health monitor stopped");
    }

    /// Stop and wait for the background loops to finish
    pub async fn shutdown(&self) {
        self.stop();
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_sampling(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.health_check_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.sample_now().await;
                    debug!(
                        memory_percent = snapshot.memory_percent * 100.0,
                        cpu_temperature_c = snapshot.cpu_temperature_c,
                        live_workers = snapshot.live_workers,
                        error_rate = snapshot.error_rate(),
                        "Health sample"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health sampling loop");
                    break;
                }
            }
        }
    }

    async fn run_alerts(
        &self,
        mut alert_rx: mpsc::Receiver<Alert>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(alert) = alert_rx.recv() => {
                    self.process_alert(alert);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down alert loop");
                    break;
                }
            }
        }
    }

    fn process_alert(&self, alert: Alert) {
        self.logger.log_alert(&alert);
        lock(&self.history).push(alert);
    }

    /// Take one sample, publish it and evaluate alert thresholds
    pub async fn sample_now(&self) -> SystemMetrics {
        let memory_used_bytes = match self.sampler.resident_memory_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                if !self.memory_failure_logged.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Memory telemetry unavailable, reporting zero");
                }
                0
            }
        };

        let cpu_temperature_c = match self.sampler.cpu_temperature_c().await {
            Ok(Some(temp)) => temp,
            Ok(None) => {
                if !self.temperature_failure_logged.swap(true, Ordering::Relaxed) {
                    info!("No thermal sensor found, reporting zero temperature");
                }
                0.0
            }
            Err(e) => {
                if !self.temperature_failure_logged.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Temperature telemetry unavailable, reporting zero");
                }
                0.0
            }
        };

        self.halve_counters_if_needed();

        let memory_percent = if self.config.max_memory_bytes > 0 {
            memory_used_bytes as f64 / self.config.max_memory_bytes as f64
        } else {
            0.0
        };

        let snapshot = SystemMetrics {
            cpu_temperature_c,
            memory_used_bytes,
            memory_percent,
            live_workers: self.live_workers.load(Ordering::Relaxed),
            success_count: self.successes.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            last_sample: Some(Utc::now()),
        };

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        self.metrics.set_system(&snapshot);
        self.evaluate_alerts(&snapshot);

        snapshot
    }

    fn halve_counters_if_needed(&self) {
        let successes = self.successes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        if successes + errors > self.config.counter_halving_threshold {
            // Subtract rather than store so concurrent increments survive
            self.successes.fetch_sub(successes / 2, Ordering::Relaxed);
            self.errors.fetch_sub(errors / 2, Ordering::Relaxed);
            debug!(successes, errors, "Halved success/error counters");
        }
    }

    fn evaluate_alerts(&self, snapshot: &SystemMetrics) {
        let t = &self.thresholds;

        if snapshot.memory_percent > t.memory_critical {
            self.emit(Alert::new(
                AlertKind::Memory,
                AlertSeverity::Critical,
                format!(
                    "Memory usage critical: {:.1}% of {} bytes",
                    snapshot.memory_percent * 100.0,
                    self.config.max_memory_bytes
                ),
            ));
            self.relieve_memory_pressure();
        } else if snapshot.memory_percent > t.memory_warn {
            self.emit(Alert::new(
                AlertKind::Memory,
                AlertSeverity::Warning,
                format!("Memory usage high: {:.1}%", snapshot.memory_percent * 100.0),
            ));
        }

        if snapshot.cpu_temperature_c > t.thermal_critical_c {
            self.emit(Alert::new(
                AlertKind::Thermal,
                AlertSeverity::Critical,
                format!("CPU temperature critical: {:.1}°C", snapshot.cpu_temperature_c),
            ));
        } else if snapshot.cpu_temperature_c > t.thermal_warn_c {
            self.emit(Alert::new(
                AlertKind::Thermal,
                AlertSeverity::Warning,
                format!("CPU temperature high: {:.1}°C", snapshot.cpu_temperature_c),
            ));
        }

        let error_rate = snapshot.error_rate();
        if error_rate > t.error_rate_critical {
            self.emit(Alert::new(
                AlertKind::ErrorRate,
                AlertSeverity::Critical,
                format!("Error rate critical: {:.2}%", error_rate * 100.0),
            ));
        } else if error_rate > t.error_rate_warn {
            self.emit(Alert::new(
                AlertKind::ErrorRate,
                AlertSeverity::Warning,
                format!("Error rate high: {:.2}%", error_rate * 100.0),
            ));
        }
    }

    /// Queue an alert without blocking. Dropped and counted when the channel is full.
    pub fn emit(&self, alert: Alert) {
        self.metrics.inc_alert(&alert);

        match self.alert_tx.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.dropped_alerts.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_alerts_dropped();
                warn!(
                    kind = %alert.kind,
                    severity = %alert.severity,
                    "Alert channel full, dropping alert"
                );
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                debug!(kind = %alert.kind, "Alert channel closed, dropping alert");
            }
        }
    }

    /// Run every registered relief hook, returning the number of items freed
    pub fn relieve_memory_pressure(&self) -> usize {
        let reliefs: Vec<_> = self
            .reliefs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut released = 0;
        for relief in &reliefs {
            let freed = relief.relieve();
            debug!(hook = %relief.name(), freed, "Pressure relief hook ran");
            released += freed;
        }

        self.metrics.inc_pressure_relief();
        info!(
            hooks = reliefs.len(),
            released, "Memory pressure relief requested"
        );
        released
    }

    /// Register a hook run on critical memory pressure
    pub fn register_relief(&self, relief: Arc<dyn PressureRelief>) {
        info!(hook = %relief.name(), "Registered memory pressure relief hook");
        self.reliefs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(relief);
    }

    /// Copy of the latest snapshot
    pub fn metrics(&self) -> SystemMetrics {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.config.max_memory_bytes
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Error rate over the live counters, ahead of the next sample
    pub fn error_rate(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total = successes + errors;
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }

    /// Shared executor gauge. The worker pool increments and decrements it.
    pub fn worker_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_workers)
    }

    pub fn dropped_alerts(&self) -> u64 {
        self.dropped_alerts.load(Ordering::Relaxed)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        lock(&self.history).recent(limit)
    }

    /// True when memory, temperature or error rate is above its critical threshold
    pub fn should_throttle(&self) -> bool {
        let snapshot = self.metrics();
        let t = &self.thresholds;
        snapshot.memory_percent > t.memory_critical
            || snapshot.cpu_temperature_c > t.thermal_critical_c
            || self.error_rate() > t.error_rate_critical
    }

    /// Recommended executor count between `min` and `max`
    pub fn optimal_worker_count(&self, max: usize, min: usize) -> usize {
        let snapshot = self.metrics();
        let t = &self.thresholds;

        if snapshot.cpu_temperature_c >= t.thermal_critical_c
            || snapshot.memory_percent >= t.memory_emergency
        {
            min
        } else if snapshot.cpu_temperature_c >= t.thermal_warn_c
            || snapshot.memory_percent >= t.memory_critical
        {
            (max / 2).max(min)
        } else {
            max
        }
    }

    /// Batch size adapted to the current snapshot
    pub fn optimal_batch_size(&self, base: usize, profile: &PerformanceProfile) -> usize {
        let snapshot = self.metrics();
        scaled_batch_size(
            base,
            profile,
            snapshot.memory_percent,
            snapshot.cpu_temperature_c,
        )
    }

    /// Overall health derived from the latest snapshot
    pub fn status(&self) -> HealthStatus {
        let snapshot = self.metrics();
        let t = &self.thresholds;
        let error_rate = snapshot.error_rate();

        if snapshot.memory_percent > t.memory_critical
            || snapshot.cpu_temperature_c > t.thermal_critical_c
            || error_rate > t.error_rate_critical
        {
            HealthStatus::Unhealthy
        } else if snapshot.memory_percent > t.memory_warn
            || snapshot.cpu_temperature_c > t.thermal_warn_c
            || error_rate > t.error_rate_warn
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: self.status(),
            metrics: self.metrics(),
            error_rate: self.error_rate(),
            recent_alerts: self.recent_alerts(10),
            dropped_alerts: self.dropped_alerts(),
        }
    }
}

/// Scale `base` by memory and temperature, clamped to the profile bounds
pub fn scaled_batch_size(
    base: usize,
    profile: &PerformanceProfile,
    memory_percent: f64,
    cpu_temperature_c: f64,
) -> usize {
    let mut size = base as f64;

    if profile.memory_aware {
        if memory_percent > BATCH_MEMORY_HIGH {
            size *= 0.5;
        } else if memory_percent < BATCH_MEMORY_LOW {
            size *= 1.5;
        }
    }

    if profile.thermal_aware {
        if cpu_temperature_c > BATCH_THERMAL_HIGH_C {
            size *= 0.6;
        } else if cpu_temperature_c < BATCH_THERMAL_LOW_C {
            size *= 1.3;
        }
    }

    let min = profile.min_batch;
    let max = profile.max_batch.max(min);
    (size.round() as usize).clamp(min, max)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
