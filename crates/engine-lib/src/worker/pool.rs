//! Dynamically sized worker pool
//!
//! Executors pull from one bounded task queue. A scale loop moves the executor
//! count toward the health monitor's recommendation, and a single result loop
//! feeds outcomes back into the monitor and the result sink.

use super::task::{ResultSink, Task, TaskResult, UnitOfWork};
use super::WorkerPoolStats;
use crate::config::WorkerPoolConfig;
use crate::error::{EngineError, EngineResult};
use crate::health::HealthMonitor;
use crate::observability::EngineMetrics;
use crate::schedule::Scheduler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// One running executor and the means to stop it
struct Executor {
    id: usize,
    quit: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    scheduler: Arc<Scheduler>,
    monitor: Arc<HealthMonitor>,
    sink: Arc<dyn ResultSink>,
    handlers: HashMap<String, Arc<dyn UnitOfWork>>,
    task_tx: Mutex<Option<mpsc::Sender<Task>>>,
    task_rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    result_tx: Mutex<Option<mpsc::Sender<TaskResult>>>,
    result_rx: Mutex<Option<mpsc::Receiver<TaskResult>>>,
    /// Oldest first; scale-down stops from the back
    executors: Mutex<Vec<Executor>>,
    next_worker_id: AtomicUsize,
    /// Shared with the monitor so samples see the live executor count
    active: Arc<AtomicUsize>,
    processed: AtomicU64,
    errors: AtomicU64,
    stats_tx: watch::Sender<WorkerPoolStats>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    metrics: EngineMetrics,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.queue_capacity());
        let (result_tx, result_rx) = mpsc::channel(config.result_buffer.max(1));
        let (stats_tx, _) = watch::channel(WorkerPoolStats::default());
        let (shutdown, _) = broadcast::channel(1);
        let monitor = Arc::clone(scheduler.monitor());
        let active = monitor.worker_gauge();

        Self {
            config,
            scheduler,
            monitor,
            sink,
            handlers: HashMap::new(),
            task_tx: Mutex::new(Some(task_tx)),
            task_rx: tokio::sync::Mutex::new(task_rx),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            executors: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            active,
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            stats_tx,
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics: EngineMetrics::new(),
        }
    }

    /// Register the unit of work for a task kind. Must happen before `start`.
    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn UnitOfWork>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Spawn the minimum executors, the result loop and the scale loop
    pub fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already started or stopped");
            return;
        }

        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            queue_capacity = self.config.queue_capacity(),
            handlers = ?self.handlers.keys().collect::<Vec<_>>(),
            "Starting worker pool"
        );

        {
            let mut executors = lock(&self.executors);
            for _ in 0..self.config.min_workers {
                if let Some(executor) = self.spawn_executor() {
                    executors.push(executor);
                }
            }
        }

        let mut handles = Vec::with_capacity(2);

        if let Some(result_rx) = lock(&self.result_rx).take() {
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pool.run_results(result_rx).await;
            }));
        }

        let pool = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            pool.run_scaling(shutdown).await;
        }));

        lock(&self.handles).extend(handles);
        self.publish_stats();
    }

    fn spawn_executor(self: &Arc<Self>) -> Option<Executor> {
        let result_tx = lock(&self.result_tx).clone()?;
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (quit, quit_rx) = oneshot::channel();

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            pool.run_executor(id, quit_rx, result_tx).await;
        });

        self.active.fetch_add(1, Ordering::AcqRel);
        Some(Executor { id, quit, handle })
    }

    async fn run_executor(
        &self,
        worker_id: usize,
        mut quit: oneshot::Receiver<()>,
        result_tx: mpsc::Sender<TaskResult>,
    ) {
        debug!(worker_id, "Executor started");

        loop {
            let task = tokio::select! {
                biased;
                _ = &mut quit => break,
                task = async { self.task_rx.lock().await.recv().await } => task,
            };

            // Queue closed and drained
            let Some(task) = task else { break };

            let result = self.execute(worker_id, task).await;
            if result_tx.send(result).await.is_err() {
                break;
            }
        }

        debug!(worker_id, "Executor stopped");
    }

    /// Pause taken before each task: the adaptive delay, stretched while throttling
    pub(crate) fn task_delay(&self) -> Duration {
        let delay = self.scheduler.adaptive_delay(self.config.base_delay());
        if self.monitor.should_throttle() {
            delay.saturating_mul(self.config.throttle_delay_multiplier.max(1))
        } else {
            delay
        }
    }

    async fn execute(&self, worker_id: usize, task: Task) -> TaskResult {
        let delay = self.task_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let started = Instant::now();
        // Units of work bound their own network waits
        let outcome = match self.handlers.get(&task.kind) {
            Some(handler) => handler.execute(&task).await.map_err(|e| format!("{:#}", e)),
            None => Err(EngineError::UnknownTaskKind(task.kind.clone()).to_string()),
        };

        let (success, payload, error) = match outcome {
            Ok(payload) => (true, Some(payload), None),
            Err(error) => (false, None, Some(error)),
        };

        TaskResult {
            task_id: task.id,
            kind: task.kind,
            success,
            payload,
            error,
            duration: started.elapsed(),
            worker_id,
        }
    }

    async fn run_results(&self, mut result_rx: mpsc::Receiver<TaskResult>) {
        while let Some(result) = result_rx.recv().await {
            self.handle_result(result).await;
        }
        debug!("Result loop finished");
    }

    async fn handle_result(&self, result: TaskResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .observe_task(result.success, result.duration.as_secs_f64());

        if result.success {
            self.monitor.record_success();
            if let Some(payload) = &result.payload {
                if let Err(e) = self.sink.save(payload).await {
                    warn!(task_id = %result.task_id, error = %format!("{:#}", e), "Failed to save result");
                }
            }
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            self.monitor.record_error();
            debug!(
                task_id = %result.task_id,
                kind = %result.kind,
                worker_id = result.worker_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Task failed"
            );
        }

        self.publish_stats();
    }

    async fn run_scaling(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.scale_interval());
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.adjust_workers();
                }
                _ = shutdown.recv() => {
                    info!("Shutting down worker scaling loop");
                    break;
                }
            }
        }
    }

    /// Move the executor count at most one step toward the monitor's target
    pub fn adjust_workers(self: &Arc<Self>) -> usize {
        let target = self
            .monitor
            .optimal_worker_count(self.config.max_workers, self.config.min_workers);

        let mut executors = lock(&self.executors);
        let current = executors.len();
        if self.stopped.load(Ordering::SeqCst) || target == current {
            return current;
        }

        let step = self.config.scale_step.max(1);
        if target > current {
            for _ in 0..(target - current).min(step) {
                match self.spawn_executor() {
                    Some(executor) => executors.push(executor),
                    None => break,
                }
            }
        } else {
            for _ in 0..(current - target).min(step) {
                if let Some(executor) = executors.pop() {
                    debug!(worker_id = executor.id, "Stopping executor");
                    // An executor finishes its in-flight task before exiting
                    let _ = executor.quit.send(());
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        let now = executors.len();
        drop(executors);

        info!(from = current, to = now, target, "Scaled worker pool");
        self.publish_stats();
        now
    }

    /// Queue a task, waiting while the queue is full
    pub async fn submit_task(&self, task: Task) -> EngineResult<()> {
        let tx = self.sender()?;
        tx.send(task).await.map_err(|_| EngineError::QueueClosed)
    }

    /// Queue a task without waiting
    pub fn try_submit_task(&self, task: Task) -> EngineResult<()> {
        let tx = self.sender()?;
        tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Closed(_) => EngineError::QueueClosed,
        })
    }

    fn sender(&self) -> EngineResult<mpsc::Sender<Task>> {
        lock(&self.task_tx).clone().ok_or(EngineError::QueueClosed)
    }

    /// Close the queue and wait for the executors to drain it
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker pool");

        let _ = self.shutdown.send(());
        lock(&self.task_tx).take();
        lock(&self.result_tx).take();

        let executors: Vec<Executor> = lock(&self.executors).drain(..).collect();
        for Executor { quit, handle, .. } in executors {
            // Dropping `quit` early would stop the executor before the queue is drained
            let _ = handle.await;
            drop(quit);
            self.active.fetch_sub(1, Ordering::AcqRel);
        }

        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.publish_stats();
        let stats = self.stats();
        info!(
            processed = stats.processed,
            errors = stats.errors,
            "Worker pool stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.executors).len()
    }

    pub fn queued_tasks(&self) -> usize {
        lock(&self.task_tx)
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            active_workers: self.active.load(Ordering::Acquire),
            queued_tasks: self.queued_tasks(),
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Watch the stats republished after every result and scale change
    pub fn subscribe_stats(&self) -> watch::Receiver<WorkerPoolStats> {
        self.stats_tx.subscribe()
    }

    fn publish_stats(&self) {
        let stats = self.stats();
        self.metrics.set_worker_stats(&stats);
        self.stats_tx.send_replace(stats);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
