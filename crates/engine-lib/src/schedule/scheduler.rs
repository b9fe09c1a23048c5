//! Performance mode scheduler
//!
//! Blends the time-of-day policy with health feedback:
//! - the mode loop re-arms a sleep until the next window boundary
//! - the throttle loop recomputes the throttle level every health-check interval
//! - `adaptive_delay` and `should_throttle` answer per-task questions

use super::clock::{Clock, SystemClock};
use super::throttle::{compute_throttle_level, ThrottleLevel};
use super::window::DailyWindow;
use crate::config::{EngineConfig, ProfilesConfig};
use crate::error::EngineResult;
use crate::health::HealthMonitor;
use crate::models::{PerformanceMode, PerformanceProfile};
use crate::observability::{EngineMetrics, StructuredLogger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

/// Degrees below the thermal limit at which full-power delays double
const THERMAL_HEADROOM_C: f64 = 5.0;

pub struct Scheduler {
    full_power_window: DailyWindow,
    high_performance_window: Option<DailyWindow>,
    high_performance_enabled: AtomicBool,
    profiles: ProfilesConfig,
    monitor: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    check_interval: Duration,
    last_mode: RwLock<Option<PerformanceMode>>,
    throttle: RwLock<ThrottleLevel>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl Scheduler {
    /// Create a scheduler on the system clock at the configured UTC offset
    pub fn new(config: &EngineConfig, monitor: Arc<HealthMonitor>) -> EngineResult<Self> {
        let clock = SystemClock::new(config.schedule.utc_offset_minutes)?;
        Self::with_clock(config, monitor, Arc::new(clock))
    }

    pub fn with_clock(
        config: &EngineConfig,
        monitor: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            full_power_window: config.schedule.full_power_window()?,
            high_performance_window: config.schedule.high_performance_window()?,
            high_performance_enabled: AtomicBool::new(config.schedule.high_performance_enabled),
            profiles: config.profiles.clone(),
            monitor,
            clock,
            check_interval: config.monitor.health_check_interval(),
            last_mode: RwLock::new(None),
            throttle: RwLock::new(ThrottleLevel::Normal),
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("scheduler"),
        })
    }

    /// Spawn the mode and throttle loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started or stopped");
            return;
        }

        info!(
            full_power_window = %self.full_power_window,
            high_performance = self.high_performance_enabled(),
            check_interval_secs = self.check_interval.as_secs(),
            "Starting scheduler"
        );

        let scheduler = Arc::clone(self);
        let mode_shutdown = self.shutdown.subscribe();
        let mode_loop = tokio::spawn(async move {
            scheduler.run_mode_loop(mode_shutdown).await;
        });

        let scheduler = Arc::clone(self);
        let throttle_shutdown = self.shutdown.subscribe();
        let throttle_loop = tokio::spawn(async move {
            scheduler.run_throttle_loop(throttle_shutdown).await;
        });

        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([mode_loop, throttle_loop]);
    }

    /// Signal the background loops to exit. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        info!("Scheduler stopped");
    }

    /// Stop and wait for the background loops to finish
    pub async fn shutdown(&self) {
        self.stop();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Subscribe to the scheduler's stop signal.
    ///
    /// A receiver taken after `stop()` yields immediately.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        let rx = self.shutdown.subscribe();
        if !self.is_stopped() {
            return rx;
        }
        let (tx, rx) = broadcast::channel(1);
        let _ = tx.send(());
        rx
    }

    async fn run_mode_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            self.refresh_mode();
            let wait = self.time_until_mode_change();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down mode loop");
                    break;
                }
            }
        }
    }

    async fn run_throttle_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update_throttle_level();
                }
                _ = shutdown.recv() => {
                    info!("Shutting down throttle loop");
                    break;
                }
            }
        }
    }

    /// Mode in effect at `now`. High performance wins, then the night window.
    pub fn mode_at(&self, now: &chrono::DateTime<chrono::FixedOffset>) -> PerformanceMode {
        if self.high_performance_enabled() {
            let in_window = self
                .high_performance_window
                .map_or(true, |window| window.contains(now));
            if in_window {
                return PerformanceMode::HighPerformance;
            }
        }

        if self.full_power_window.contains(now) {
            PerformanceMode::FullPower
        } else {
            PerformanceMode::Conservation
        }
    }

    pub fn current_mode(&self) -> PerformanceMode {
        self.mode_at(&self.clock.now())
    }

    pub fn profile_for(&self, mode: PerformanceMode) -> &PerformanceProfile {
        match mode {
            PerformanceMode::HighPerformance => &self.profiles.high_performance,
            PerformanceMode::FullPower => &self.profiles.full_power,
            PerformanceMode::Conservation => &self.profiles.conservation,
        }
    }

    /// Profile of the mode in effect right now
    pub fn current_profile(&self) -> &PerformanceProfile {
        self.profile_for(self.current_mode())
    }

    pub fn is_full_power_time(&self) -> bool {
        self.full_power_window.contains(&self.clock.now())
    }

    pub fn high_performance_enabled(&self) -> bool {
        self.high_performance_enabled.load(Ordering::SeqCst)
    }

    /// Explicitly enable or disable high-performance mode
    pub fn set_high_performance(&self, enabled: bool) {
        let previous = self.high_performance_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "High-performance mode toggled");
            self.refresh_mode();
        }
    }

    /// Time until the active mode can next change
    pub fn time_until_mode_change(&self) -> Duration {
        let now = self.clock.now();
        if self.mode_at(&now) == PerformanceMode::HighPerformance {
            return self.check_interval;
        }

        let mut wait = self.full_power_window.time_until_boundary(&now);
        if self.high_performance_enabled() {
            if let Some(window) = &self.high_performance_window {
                wait = wait.min(window.time_until_boundary(&now));
            }
        }
        wait
    }

    /// Re-evaluate the mode, logging and checking resources on a transition
    pub fn refresh_mode(&self) -> PerformanceMode {
        let mode = self.current_mode();
        let previous = {
            let mut last = self.last_mode.write().unwrap_or_else(PoisonError::into_inner);
            last.replace(mode)
        };

        if previous != Some(mode) {
            self.logger
                .log_mode_change(previous, mode, self.profile_for(mode));
            self.metrics.set_mode(mode);
            self.check_resources();
        }
        mode
    }

    /// Sanity check run on every mode transition
    fn check_resources(&self) {
        let snapshot = self.monitor.metrics();
        let ceiling = self.monitor.max_memory_bytes();

        if snapshot.memory_used_bytes > ceiling / 2 {
            warn!(
                memory_used_bytes = snapshot.memory_used_bytes,
                max_memory_bytes = ceiling,
                "Memory above half the ceiling at mode change, requesting relief"
            );
            self.monitor.relieve_memory_pressure();
        }

        if snapshot.cpu_temperature_c > self.monitor.thresholds().thermal_warn_c {
            warn!(
                cpu_temperature_c = snapshot.cpu_temperature_c,
                "CPU temperature elevated at mode change"
            );
        }
    }

    pub fn throttle_level(&self) -> ThrottleLevel {
        *self.throttle.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute the throttle level from the latest snapshot, logging changes
    pub fn update_throttle_level(&self) -> ThrottleLevel {
        let snapshot = self.monitor.metrics();
        let level = compute_throttle_level(&snapshot, self.monitor.thresholds());

        let previous = {
            let mut current = self.throttle.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, level)
        };

        if previous != level {
            self.logger.log_throttle_change(previous, level, &snapshot);
            self.metrics.set_throttle_level(level);
        }
        level
    }

    /// Delay to apply before the next unit of work
    pub fn adaptive_delay(&self, base: Duration) -> Duration {
        match self.current_mode() {
            PerformanceMode::HighPerformance => {
                let percent = u32::from(self.throttle_level().percent());
                base.saturating_mul(100 + percent) / 100
            }
            PerformanceMode::Conservation => self.profiles.conservation.request_delay(),
            PerformanceMode::FullPower => {
                let delay = self.profiles.full_power.request_delay();
                let limit = self.monitor.thresholds().thermal_critical_c;
                if self.monitor.metrics().cpu_temperature_c > limit - THERMAL_HEADROOM_C {
                    delay.saturating_mul(2)
                } else {
                    delay
                }
            }
        }
    }

    /// Whether callers should slow down right now
    pub fn should_throttle(&self) -> bool {
        match self.current_mode() {
            PerformanceMode::HighPerformance => self.monitor.should_throttle(),
            mode => mode != PerformanceMode::FullPower,
        }
    }

    /// Batch size for the current profile, adapted to telemetry
    pub fn optimal_batch_size(&self) -> usize {
        let profile = self.current_profile();
        self.monitor.optimal_batch_size(profile.batch_size, profile)
    }

    pub fn record_success(&self) {
        self.monitor.record_success();
    }

    pub fn record_error(&self) {
        self.monitor.record_error();
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Wait for the full-power window when it opens within `max_wait`
    ///
    /// Returns true when the engine is in a favorable mode on return.
    pub async fn wait_for_full_power(&self, operation: &str, max_wait: Duration) -> bool {
        if self.current_mode() != PerformanceMode::Conservation {
            return true;
        }

        let wait = self.full_power_window.time_until_boundary(&self.clock.now());
        if wait > max_wait {
            info!(
                operation = %operation,
                wait_secs = wait.as_secs(),
                "Full-power window too far away, starting in conservation mode"
            );
            return false;
        }

        info!(
            operation = %operation,
            wait_secs = wait.as_secs(),
            "Waiting for full-power window"
        );

        let mut shutdown = self.shutdown.subscribe();
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                self.refresh_mode() != PerformanceMode::Conservation
            }
            _ = shutdown.recv() => false,
        }
    }
}
