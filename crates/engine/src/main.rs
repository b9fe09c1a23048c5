//! Recon Engine - resource-aware network reconnaissance
//!
//! This binary runs the concurrency control plane continuously,
//! resolving and probing the configured targets without exhausting the host.

use anyhow::{Context, Result};
use engine_lib::{
    health::{HealthMonitor, ProcSampler},
    observability::StructuredLogger,
    pool::ConnectionPool,
    schedule::Scheduler,
    worker::{
        BatchRunner, DnsLookup, JsonLinesSink, MemorySink, ResultSink, TcpBannerProbe, Task,
        WorkerPool,
    },
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period for background work once shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting recon-engine");

    let config = config::AppConfig::load()?;
    let engine = &config.engine;
    info!(
        instance = %config.instance,
        targets = config.targets.len(),
        ports = ?config.ports,
        "Engine configured"
    );

    // Health monitor
    let sampler = Arc::new(ProcSampler::new());
    let monitor = Arc::new(HealthMonitor::new(
        engine.monitor.clone(),
        engine.thresholds.clone(),
        sampler,
    ));
    monitor.sample_now().await;
    monitor.start();

    // Scheduler
    let scheduler = Arc::new(Scheduler::new(engine, Arc::clone(&monitor))?);
    scheduler.start();

    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(ENGINE_VERSION, scheduler.current_mode());

    // Connection pool, shedding idle sockets under memory pressure
    let pool = Arc::new(ConnectionPool::new(engine.pool.clone()));
    pool.start();
    monitor.register_relief(pool.clone());

    let sink: Arc<dyn ResultSink> = match &config.results_path {
        Some(path) => Arc::new(JsonLinesSink::open(path).await?),
        None => Arc::new(MemorySink::new()),
    };

    // Worker pool
    let mut workers = WorkerPool::new(
        engine.workers.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&sink),
    );
    workers.register_handler(
        "banner",
        Arc::new(
            TcpBannerProbe::new(Arc::clone(&pool), engine.pool.connect_timeout())
                .with_scheduler(Arc::clone(&scheduler)),
        ),
    );
    let workers = Arc::new(workers);
    workers.start();

    // Health, status and metrics server
    let app_state = Arc::new(api::AppState::new(
        Arc::clone(&scheduler),
        Arc::clone(&pool),
        Some(Arc::clone(&workers)),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Periodic engine report
    let report_handle = {
        let scheduler = Arc::clone(&scheduler);
        let pool = Arc::clone(&pool);
        let workers = Arc::clone(&workers);
        let logger = logger.clone();
        let mut shutdown = scheduler.subscribe_shutdown();
        let period = Duration::from_secs(config.report_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        logger.log_report(
                            scheduler.current_mode(),
                            scheduler.throttle_level(),
                            &scheduler.monitor().metrics(),
                            &pool.stats(),
                            Some(&workers.stats()),
                        );
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    // Reconnaissance workload
    let workload_handle = {
        let runner = BatchRunner::new(
            Arc::clone(&scheduler),
            Arc::clone(&sink),
            engine.batch.clone(),
            engine.workers.base_delay(),
        );
        let scheduler = Arc::clone(&scheduler);
        let workers = Arc::clone(&workers);
        let targets = config.targets.clone();
        let ports = config.ports.clone();
        let max_wait = engine.batch.max_wait_for_full_power();
        tokio::spawn(async move {
            if let Err(e) = run_workload(runner, scheduler, workers, targets, ports, max_wait).await {
                warn!(error = %format!("{:#}", e), "Workload stopped");
            }
        })
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    scheduler.stop();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        // Closing the queue also unblocks a pending probe submission
        workers.stop().await;
        let _ = workload_handle.await;
        scheduler.shutdown().await;
        monitor.shutdown().await;
        let _ = report_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Shutdown grace period elapsed, abandoning in-flight work"
        );
    }

    pool.close();
    api_handle.abort();

    Ok(())
}

/// Resolve every target in batches, then queue banner probes for each port
async fn run_workload(
    runner: BatchRunner,
    scheduler: Arc<Scheduler>,
    workers: Arc<WorkerPool>,
    targets: Vec<String>,
    ports: Vec<u16>,
    max_wait: Duration,
) -> Result<()> {
    if targets.is_empty() {
        info!("No targets configured, idling");
        return Ok(());
    }

    if !scheduler.wait_for_full_power("dns", max_wait).await && scheduler.is_stopped() {
        info!("Shutdown while waiting for the full-power window");
        return Ok(());
    }

    let items: Vec<Value> = targets.iter().map(|t| json!(t)).collect();
    let lookup = Arc::new(
        DnsLookup::new(scheduler.current_profile().timeout())
            .with_scheduler(Arc::clone(&scheduler)),
    );
    let summary = runner
        .run_phase("dns", "dns", &items, lookup, scheduler.subscribe_shutdown())
        .await?;
    if summary.cancelled {
        return Ok(());
    }

    let mut queued = 0usize;
    for target in &targets {
        for port in &ports {
            let task = Task::new(
                format!("banner-{}:{}", target, port),
                "banner",
                json!({ "host": target, "port": port }),
            );
            if workers.submit_task(task).await.is_err() {
                info!(queued, "Worker pool closed, stopping probe submission");
                return Ok(());
            }
            queued += 1;
        }
    }

    info!(queued, "All banner probes queued");
    Ok(())
}
