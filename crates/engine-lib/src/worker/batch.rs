//! Join-on-batch phase driver
//!
//! Splits a phase's items into adaptively sized batches, runs each batch with
//! bounded fan-out, and records progress once the whole batch has finished so
//! an interrupted phase resumes at the first unfinished batch.

use super::task::{result_key, ResultSink, Task, UnitOfWork};
use crate::config::BatchConfig;
use crate::models::Progress;
use crate::observability::StructuredLogger;
use crate::schedule::Scheduler;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of one phase run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub batches: usize,
    /// First item index not yet covered by recorded progress
    pub next_index: usize,
    pub cancelled: bool,
}

/// Identity of an item: the string itself, or its `key` field
pub fn item_key(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        other => result_key(other).map(str::to_string),
    }
}

pub struct BatchRunner {
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn ResultSink>,
    config: BatchConfig,
    base_delay: Duration,
    logger: StructuredLogger,
}

impl BatchRunner {
    pub fn new(
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn ResultSink>,
        config: BatchConfig,
        base_delay: Duration,
    ) -> Self {
        Self {
            scheduler,
            sink,
            config,
            base_delay,
            logger: StructuredLogger::new("batch-runner"),
        }
    }

    /// Run `items` through `work` in batches
    ///
    /// A message on `cancel` (or its sender going away) stops admission,
    /// as does a stopped scheduler.
    /// Tasks already in flight are detached and finish on their own.
    pub async fn run_phase(
        &self,
        phase: &str,
        kind: &str,
        items: &[Value],
        work: Arc<dyn UnitOfWork>,
        mut cancel: broadcast::Receiver<()>,
    ) -> Result<PhaseSummary> {
        let resume = self
            .sink
            .last_progress(phase)
            .await
            .with_context(|| format!("Failed to load progress for phase {}", phase))?;

        let mut index = resume.as_ref().map_or(0, |p| p.item_index).min(items.len());
        let mut batch_index = resume.as_ref().map_or(0, |p| p.batch_index + 1);
        let mut summary = PhaseSummary {
            next_index: index,
            ..Default::default()
        };

        info!(
            phase = %phase,
            total = items.len(),
            resume_at = index,
            mode = %self.scheduler.current_mode(),
            "Starting phase"
        );

        while index < items.len() {
            if self.scheduler.is_stopped() || is_cancelled(&mut cancel) {
                summary.cancelled = true;
                break;
            }

            let batch_size = self.scheduler.optimal_batch_size().max(1);
            let end = (index + batch_size).min(items.len());
            let profile = self.scheduler.current_profile();
            let permits = Arc::new(Semaphore::new(profile.worker_count.max(1)));
            let limit = profile.timeout();
            let mut in_flight = JoinSet::new();

            debug!(
                phase = %phase,
                batch_index,
                start = index,
                end,
                concurrency = profile.worker_count,
                "Starting batch"
            );

            for (offset, item) in items[index..end].iter().enumerate() {
                if let Some(key) = item_key(item) {
                    match self.sink.is_done(&key).await {
                        Ok(true) => {
                            summary.skipped += 1;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(key = %key, error = %format!("{:#}", e), "Done check failed"),
                    }
                }

                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => permit,
                    _ = cancel.recv() => {
                        summary.cancelled = true;
                        break;
                    }
                };
                // The semaphore is never closed
                let Ok(permit) = permit else { break };

                let task = Task::new(format!("{}-{}", phase, index + offset), kind, item.clone());
                let work = Arc::clone(&work);
                let delay = self.scheduler.adaptive_delay(self.base_delay);
                in_flight.spawn(async move {
                    let _permit = permit;
                    tokio::time::sleep(delay).await;
                    match tokio::time::timeout(limit, work.execute(&task)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(anyhow::anyhow!("{} timed out after {:?}", task.id, limit)),
                    }
                });
            }

            if !summary.cancelled {
                loop {
                    tokio::select! {
                        joined = in_flight.join_next() => match joined {
                            Some(joined) => self.handle_outcome(phase, joined, &mut summary).await,
                            None => break,
                        },
                        _ = cancel.recv() => {
                            summary.cancelled = true;
                            break;
                        }
                    }
                }
            }

            if summary.cancelled {
                in_flight.detach_all();
                break;
            }

            let progress = Progress::new(phase, batch_index, end);
            if let Err(e) = self.sink.record_progress(&progress).await {
                warn!(phase = %phase, batch_index, error = %format!("{:#}", e), "Failed to record progress");
            }

            summary.batches += 1;
            summary.next_index = end;
            batch_index += 1;
            index = end;

            if index < items.len() && self.scheduler.should_throttle() {
                let pause = self.config.throttle_pause();
                debug!(phase = %phase, pause_ms = pause.as_millis() as u64, "Pausing between batches");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = cancel.recv() => {
                        summary.cancelled = true;
                        break;
                    }
                }
            }
        }

        if summary.cancelled {
            info!(phase = %phase, next_index = summary.next_index, "Phase cancelled");
        }
        self.logger
            .log_phase_complete(phase, summary.processed, summary.failed, summary.skipped);
        Ok(summary)
    }

    async fn handle_outcome(
        &self,
        phase: &str,
        joined: std::result::Result<Result<Value>, tokio::task::JoinError>,
        summary: &mut PhaseSummary,
    ) {
        match joined {
            Ok(Ok(payload)) => {
                summary.processed += 1;
                self.scheduler.record_success();
                if let Err(e) = self.sink.save(&payload).await {
                    warn!(phase = %phase, error = %format!("{:#}", e), "Failed to save result");
                }
            }
            Ok(Err(e)) => {
                summary.failed += 1;
                self.scheduler.record_error();
                debug!(phase = %phase, error = %format!("{:#}", e), "Item failed");
            }
            Err(e) => {
                summary.failed += 1;
                self.scheduler.record_error();
                warn!(phase = %phase, error = %e, "Item task panicked");
            }
        }
    }
}

fn is_cancelled(cancel: &mut broadcast::Receiver<()>) -> bool {
    !matches!(cancel.try_recv(), Err(TryRecvError::Empty))
}
