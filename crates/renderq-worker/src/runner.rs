//! Task runner: polls the orchestrator for work and drives the codec.
//!
//! Concurrency is bounded by a semaphore; each in-flight task renews its
//! lease on a heartbeat. If renewal terminally fails the attempt is
//! abandoned without reporting, since the orchestrator has already
//! reclaimed (or will reclaim) the task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use renderq_engine::{AcquiredTask, EngineError, Orchestrator, TaskLogger};
use renderq_models::{Checkpoint, TaskError, TaskId, WorkerId};

use crate::codec::{CodecEngine, ProgressHandle, ReportOutcome};
use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::retry::{retry_async, FailureTracker, RetryConfig};

/// Routes codec progress reports through the orchestrator.
struct OrchestratorProgress {
    orchestrator: Arc<Orchestrator>,
    task: TaskId,
    worker: WorkerId,
}

#[async_trait]
impl ProgressHandle for OrchestratorProgress {
    async fn report(
        &self,
        progress: u8,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ReportOutcome, TaskError> {
        match self
            .orchestrator
            .report_progress(&self.task, &self.worker, progress, checkpoint)
            .await
        {
            Ok(ack) => Ok(ReportOutcome {
                cancel_requested: ack.cancel_requested,
            }),
            Err(e) if e.is_concurrency_signal() => Err(TaskError::transient(
                "LEASE_LOST",
                "lease no longer held, attempt is inadmissible",
            )),
            Err(e) => Err(TaskError::transient("REPORT_FAILED", e.to_string())),
        }
    }
}

/// Worker main loop over one orchestrator and one codec engine.
pub struct TaskRunner {
    config: WorkerConfig,
    orchestrator: Arc<Orchestrator>,
    codec: Arc<dyn CodecEngine>,
    worker_id: WorkerId,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl TaskRunner {
    pub fn new(
        config: WorkerConfig,
        orchestrator: Arc<Orchestrator>,
        codec: Arc<dyn CodecEngine>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            orchestrator,
            codec,
            worker_id: WorkerId::new(),
            semaphore,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Signal shutdown; `run` drains in-flight tasks and returns.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// A receiver on the runner's shutdown channel, for sharing with the
    /// orchestrator's reaper.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Poll-and-process loop; returns after a shutdown signal once
    /// in-flight tasks drain or the shutdown timeout passes.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            worker_id = %self.worker_id,
            max_concurrent = self.config.max_concurrent_tasks,
            "Starting task runner"
        );
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Hold capacity before pulling work so a popped task is never
            // stuck waiting behind a full worker.
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let next = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                next = self.orchestrator.next_task(&self.worker_id, self.config.poll_timeout) => next,
            };

            match next {
                Ok(Some(acquired)) => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let codec = Arc::clone(&self.codec);
                    let worker = self.worker_id.clone();
                    let heartbeat_interval = self.config.heartbeat_interval;
                    tokio::spawn(async move {
                        let _permit = permit;
                        execute_task(orchestrator, codec, worker, acquired, heartbeat_interval)
                            .await;
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Error polling for tasks: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        info!("Waiting for in-flight tasks to complete...");
        let _ = tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_tasks()).await;
        info!("Task runner stopped");
        Ok(())
    }

    async fn wait_for_tasks(&self) {
        loop {
            if self.semaphore.available_permits() == self.config.max_concurrent_tasks {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Drive one acquired task to a reported outcome.
async fn execute_task(
    orchestrator: Arc<Orchestrator>,
    codec: Arc<dyn CodecEngine>,
    worker: WorkerId,
    acquired: AcquiredTask,
    heartbeat_interval: Duration,
) {
    let task = acquired.task_id.clone();
    let logger = TaskLogger::new(&task, "process");
    let span = logger.create_span();
    let _guard = span.enter();

    logger.log_start(&format!(
        "attempt {} for preset {}",
        acquired.attempt, acquired.input.output_preset
    ));

    let handle = OrchestratorProgress {
        orchestrator: Arc::clone(&orchestrator),
        task: task.clone(),
        worker: worker.clone(),
    };

    let outcome = tokio::select! {
        result = codec.process(&acquired, &handle) => Some(result),
        _ = heartbeat_until_lost(&orchestrator, &task, &worker, heartbeat_interval) => None,
    };

    match outcome {
        Some(Ok(result)) => match orchestrator.report_success(&task, &worker, result).await {
            Ok(()) => logger.log_completion("processing finished"),
            Err(e) if e.is_concurrency_signal() => {
                logger.log_warning("lease lost before success could be recorded");
            }
            Err(e) => logger.log_error(&format!("failed to record success: {e}")),
        },
        Some(Err(task_error)) => {
            logger.log_error(&format!("processing failed: {task_error}"));
            match orchestrator.report_failure(&task, &worker, task_error).await {
                Ok(()) => {}
                Err(e) if e.is_concurrency_signal() => {
                    logger.log_warning("lease lost before failure could be recorded");
                }
                Err(e) => logger.log_error(&format!("failed to record failure: {e}")),
            }
        }
        None => {
            // The reaper owns the task's fate now
            logger.log_warning("lease renewal failed, abandoning attempt");
        }
    }
}

/// Renew the lease on an interval; resolves only when the lease is
/// terminally lost. Backend hiccups are retried and rate-limit-logged.
async fn heartbeat_until_lost(
    orchestrator: &Arc<Orchestrator>,
    task: &TaskId,
    worker: &WorkerId,
    interval: Duration,
) {
    let retry = RetryConfig::new("lease_renewal").with_base_delay(Duration::from_millis(200));
    let mut tracker = FailureTracker::new(3);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        ticker.tick().await;
        // Only infrastructure failures get another attempt; a lost lease
        // is final.
        let result = match orchestrator.renew_lease(task, worker).await {
            Err(e) if e.is_retryable() => {
                retry_async(&retry, || orchestrator.renew_lease(task, worker)).await
            }
            other => other,
        };

        match result {
            Ok(expires_at) => {
                tracker.record_success();
                debug!(task_id = %task, %expires_at, "Lease renewed");
            }
            Err(EngineError::Backend(e)) => {
                if tracker.record_failure() {
                    warn!(task_id = %task, "Lease renewal hit backend failure: {}", e);
                }
            }
            Err(e) => {
                warn!(task_id = %task, "Lease terminally lost: {}", e);
                return;
            }
        }
    }
}
