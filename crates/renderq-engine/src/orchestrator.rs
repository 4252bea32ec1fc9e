//! The orchestrator: authoritative owner of task records.
//!
//! Accepts new tasks, drives state transitions, supervises worker leases,
//! and decides retry vs. dead-letter vs. completion. Workers propose
//! transitions through this API and never touch records directly.
//!
//! Per-task operations are linearized by the record map's write lock, with
//! the lease store acting as the mutual-exclusion point for worker
//! ownership; there is no cross-task locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use validator::Validate;

use renderq_models::{
    Checkpoint, ErrorClass, TaskError, TaskEventKind, TaskId, TaskInput, TaskRecord, TaskStatus,
    WorkerId,
};

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lease::{LeaseStore, MemoryLeaseStore};
use crate::metrics;
use crate::publisher::{EventPublisher, EventSink};
use crate::queue::{MemoryQueue, TaskQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::RecordStore;

/// Redelivery delay for queue entries whose record lives in another
/// process; the id goes back on the shared queue instead of being consumed.
const UNKNOWN_TASK_REDELIVERY: Duration = Duration::from_secs(5);

/// Context handed to the worker that won the acquire race.
#[derive(Debug, Clone)]
pub struct AcquiredTask {
    pub task_id: TaskId,
    pub input: TaskInput,
    /// Retry attempts already consumed (0 on the first run)
    pub attempt: u32,
    pub lease_expires_at: DateTime<Utc>,
    /// Last durable checkpoint; present means resume, absent means restart
    pub checkpoint: Option<Checkpoint>,
}

/// Response to a progress report.
#[derive(Debug, Clone, Copy)]
pub struct ProgressAck {
    /// Progress as recorded (monotonic, capped at 99 while processing)
    pub progress: u8,
    /// Cancellation flag; the worker must stop and report a
    /// `Cancelled`-class failure
    pub cancel_requested: bool,
}

/// Filter for dead-letter administration queries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Only tasks whose error carries this code
    pub error_code: Option<String>,
    /// Only tasks that failed at or after this instant
    pub failed_after: Option<DateTime<Utc>>,
}

/// The task orchestration engine.
pub struct Orchestrator {
    config: EngineConfig,
    policy: RetryPolicy,
    queue: Arc<dyn TaskQueue>,
    leases: Arc<dyn LeaseStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    publisher: EventPublisher,
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    // idempotency key -> live task
    dedup: Mutex<HashMap<String, TaskId>>,
    record_store: Option<Arc<dyn RecordStore>>,
}

impl Orchestrator {
    /// Create an orchestrator over the given backends.
    pub fn new(
        config: EngineConfig,
        queue: Arc<dyn TaskQueue>,
        leases: Arc<dyn LeaseStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let policy = RetryPolicy::new(config.retry_base, config.retry_cap);
        let publisher = EventPublisher::new(&config);
        Self {
            config,
            policy,
            queue,
            leases,
            checkpoints,
            publisher,
            records: RwLock::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
            record_store: None,
        }
    }

    /// Create an orchestrator with in-process backends.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
        )
    }

    /// Attach the external audit store for terminal snapshots.
    pub fn with_record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -------------------------------------------------------------------
    // Producer-facing API
    // -------------------------------------------------------------------

    /// Validate and accept a new task; returns its id.
    pub async fn submit(&self, input: TaskInput) -> EngineResult<TaskId> {
        input
            .validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        // Hold the dedup lock across record creation so two identical
        // submissions cannot both pass the check.
        let mut dedup = self.dedup.lock().await;
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = dedup.get(key) {
                let records = self.records.read().await;
                let live = records
                    .get(existing)
                    .map(|r| !r.is_terminal())
                    .unwrap_or(false);
                if live {
                    warn!(idempotency_key = %key, existing = %existing, "Duplicate submission rejected");
                    return Err(EngineError::DuplicateTask {
                        existing: existing.clone(),
                    });
                }
            }
        }

        let record = TaskRecord::new(input, self.config.default_max_retries);
        let task = record.id.clone();
        if let Some(key) = &record.input.idempotency_key {
            dedup.insert(key.clone(), task.clone());
        }
        self.records.write().await.insert(task.clone(), record);
        drop(dedup);

        if let Err(e) = self.queue.push(task.clone(), Duration::ZERO).await {
            // Roll back so the submission can be retried
            let removed = self.records.write().await.remove(&task);
            if let Some(record) = removed {
                self.clear_dedup(&record).await;
            }
            return Err(e);
        }

        self.publisher.publish(&task, TaskEventKind::Queued).await;
        metrics::record_submitted();
        info!(task_id = %task, "Task submitted");
        Ok(task)
    }

    /// Read-only record snapshot; never advances state.
    pub async fn get_status(&self, task: &TaskId) -> EngineResult<TaskRecord> {
        self.records
            .read()
            .await
            .get(task)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))
    }

    /// Request cancellation.
    ///
    /// From `Queued` the task is removed from the queue and cancelled
    /// immediately. From `Processing` a flag is set; the worker observes it
    /// on its next progress report and stops cooperatively.
    pub async fn cancel(&self, task: &TaskId) -> EngineResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;

        match record.status {
            TaskStatus::Queued => {
                self.queue.remove(task).await?;
                record.cancel();
                record.archive();
                let snapshot = record.clone();
                drop(records);

                info!(task_id = %task, "Task cancelled while queued");
                self.finalize(&snapshot, TaskEventKind::Cancelled).await;
                Ok(())
            }
            TaskStatus::Processing => {
                record.request_cancel();
                info!(task_id = %task, "Cancellation requested, awaiting worker acknowledgement");
                Ok(())
            }
            status => Err(EngineError::NotCancellable {
                task: task.clone(),
                status,
            }),
        }
    }

    /// Register an event sink for a task.
    pub async fn subscribe(&self, task: &TaskId, sink: Arc<dyn EventSink>) -> EngineResult<()> {
        if !self.records.read().await.contains_key(task) {
            return Err(EngineError::TaskNotFound(task.clone()));
        }
        self.publisher.subscribe(task, sink).await;
        Ok(())
    }

    /// Remove an event sink.
    pub async fn unsubscribe(&self, task: &TaskId, sink_id: &str) {
        self.publisher.unsubscribe(task, sink_id).await;
    }

    // -------------------------------------------------------------------
    // Worker protocol
    // -------------------------------------------------------------------

    /// Acquire a task popped from the queue.
    ///
    /// Atomically checks the record is `Queued`, takes the lease, and
    /// transitions to `Processing`. Queue delivery is at-least-once: the
    /// loser of a pop/acquire race gets `AlreadyLeased` and must drop the
    /// item without side effects.
    pub async fn acquire(&self, task: &TaskId, worker: &WorkerId) -> EngineResult<AcquiredTask> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;

        if record.status != TaskStatus::Queued {
            return Err(EngineError::AlreadyLeased { task: task.clone() });
        }

        let lease_expires_at = self
            .leases
            .acquire(task, worker, self.config.lease_ttl)
            .await?;
        record.begin_processing(worker.clone(), lease_expires_at);

        let input = record.input.clone();
        let attempt = record.retry_count;
        drop(records);

        let checkpoint = self.checkpoints.load(task).await?;
        self.publisher
            .publish(
                task,
                TaskEventKind::Started {
                    worker_id: worker.clone(),
                },
            )
            .await;

        debug!(task_id = %task, worker_id = %worker, attempt, resuming = checkpoint.is_some(), "Task acquired");
        Ok(AcquiredTask {
            task_id: task.clone(),
            input,
            attempt,
            lease_expires_at,
            checkpoint,
        })
    }

    /// Pop-and-acquire loop for workers; silently drops duplicate
    /// deliveries that lose the acquire race.
    pub async fn next_task(
        &self,
        worker: &WorkerId,
        timeout: Duration,
    ) -> EngineResult<Option<AcquiredTask>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(task) = self.queue.pop_ready(deadline - now).await? else {
                return Ok(None);
            };
            match self.acquire(&task, worker).await {
                Ok(acquired) => return Ok(Some(acquired)),
                Err(e) if e.is_concurrency_signal() => {
                    debug!(task_id = %task, "Dropped duplicate queue delivery");
                }
                Err(EngineError::TaskNotFound(_)) => {
                    // The record may belong to another process sharing the
                    // queue backend; never consume an id we cannot serve.
                    debug!(task_id = %task, "Requeued delivery for task not in this process");
                    self.queue
                        .push(task.clone(), UNKNOWN_TASK_REDELIVERY)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a progress report from the lease holder.
    ///
    /// Rejects with `LeaseExpired` unless the caller holds the live lease;
    /// the worker must then abandon the attempt. The returned ack carries
    /// the cancellation flag.
    pub async fn report_progress(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        progress: u8,
        checkpoint: Option<Checkpoint>,
    ) -> EngineResult<ProgressAck> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;
        self.verify_lease(task, worker, record.status).await?;

        let mut saved_seq = None;
        if let Some(cp) = checkpoint {
            match self.checkpoints.save(task, cp.seq, cp.payload).await {
                Ok(()) => {
                    record.checkpoint_seq = Some(cp.seq);
                    saved_seq = Some(cp.seq);
                }
                Err(EngineError::StaleCheckpoint { stored, got, .. }) => {
                    // A retried/duplicate worker must not clobber a newer
                    // marker; ignored, diagnostics only.
                    debug!(task_id = %task, stored, got, "Stale checkpoint write ignored");
                    metrics::record_stale_checkpoint();
                }
                Err(e) => return Err(e),
            }
        }

        record.set_progress(progress);
        let ack = ProgressAck {
            progress: record.progress,
            cancel_requested: record.cancel_requested,
        };
        let value = record.progress;
        drop(records);

        self.publisher
            .publish(
                task,
                TaskEventKind::Progress {
                    value,
                    checkpoint_seq: saved_seq,
                },
            )
            .await;
        Ok(ack)
    }

    /// Extend the caller's lease.
    pub async fn renew_lease(
        &self,
        task: &TaskId,
        worker: &WorkerId,
    ) -> EngineResult<DateTime<Utc>> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;
        if record.status != TaskStatus::Processing {
            return Err(EngineError::LeaseLost { task: task.clone() });
        }

        let expires_at = self
            .leases
            .renew(task, worker, self.config.lease_ttl)
            .await?;
        record.renew_lease(expires_at);
        Ok(expires_at)
    }

    /// Record a successful terminal outcome from the lease holder. The
    /// result is the worker's opaque output reference, carried on the
    /// record and the terminal event.
    pub async fn report_success(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        result: Option<String>,
    ) -> EngineResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;
        self.verify_lease(task, worker, record.status).await?;

        self.leases.release(task, worker).await?;
        record.complete(result.clone());
        record.archive();
        let snapshot = record.clone();
        drop(records);

        info!(task_id = %task, worker_id = %worker, "Task completed");
        self.finalize(&snapshot, TaskEventKind::Completed { result })
            .await;
        Ok(())
    }

    /// Record a failed outcome from the lease holder.
    ///
    /// A `Cancelled`-class error maps straight to `Cancelled` status.
    /// Otherwise the retry policy decides between a delayed requeue and
    /// the dead-letter sink.
    pub async fn report_failure(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        error: TaskError,
    ) -> EngineResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;
        self.verify_lease(task, worker, record.status).await?;
        self.leases.release(task, worker).await?;

        if error.class == ErrorClass::Cancelled || record.cancel_requested {
            record.cancel();
            record.archive();
            let snapshot = record.clone();
            drop(records);

            info!(task_id = %task, "Task cancelled by worker acknowledgement");
            self.finalize(&snapshot, TaskEventKind::Cancelled).await;
            return Ok(());
        }

        match self
            .policy
            .decide(error.class, record.retry_count, record.max_retries)
        {
            RetryDecision::Retry { delay } => {
                // Enqueue before mutating: if the push fails the record
                // stays Processing with its lease released, and the reaper
                // reclaims it on the next scan.
                self.queue.push(task.clone(), delay).await?;
                record.requeue_for_retry();
                let retry_count = record.retry_count;
                drop(records);

                self.publisher
                    .publish(
                        task,
                        TaskEventKind::Requeued {
                            retry_count,
                            delay_ms: delay.as_millis() as u64,
                        },
                    )
                    .await;
                metrics::record_retry(error.class.as_str());
                info!(
                    task_id = %task,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Task requeued after {} failure: {}", error.class, error
                );
                Ok(())
            }
            RetryDecision::GiveUp => {
                record.fail(error.clone());
                record.archive();
                let snapshot = record.clone();
                drop(records);

                warn!(task_id = %task, "Task dead-lettered: {}", error);
                metrics::record_dead_lettered(&error.code);
                self.finalize(&snapshot, TaskEventKind::Failed { error }).await;
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------
    // Worker supervision
    // -------------------------------------------------------------------

    /// Spawn the background reaper that requeues tasks whose lease expired
    /// without renewal.
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orchestrator.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = orchestrator.reap_expired().await {
                            warn!("Reaper scan failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// One reaper scan. Returns the number of tasks reclaimed.
    ///
    /// An expired, unrenewed lease means the worker is dead: the task is
    /// requeued as a `Transient` failure (counting toward the retry
    /// budget). Late writes from the dead attempt are already inadmissible
    /// through the lease check and the checkpoint sequence rule.
    pub async fn reap_expired(&self) -> EngineResult<usize> {
        let candidates: Vec<TaskId> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| r.status == TaskStatus::Processing)
                .map(|r| r.id.clone())
                .collect()
        };

        let mut reaped = 0;
        for task in candidates {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&task) else {
                continue;
            };
            if record.status != TaskStatus::Processing {
                continue;
            }

            // Check freshness under the write lock so a renewal cannot race
            let lease = self.leases.get(&task).await?;
            let now = Utc::now();
            if lease.as_ref().map(|l| l.is_live(now)).unwrap_or(false) {
                continue;
            }
            if let Some(lease) = lease {
                self.leases.release(&task, &lease.owner).await?;
            }

            warn!(
                task_id = %task,
                worker_id = ?record.lease_owner,
                "Lease expired without renewal, reclaiming orphaned task"
            );
            metrics::record_lease_reaped();
            reaped += 1;

            if record.cancel_requested {
                // A pending cancellation wins over the retry path
                record.cancel();
                record.archive();
                let snapshot = record.clone();
                drop(records);
                self.finalize(&snapshot, TaskEventKind::Cancelled).await;
                continue;
            }

            match self
                .policy
                .decide(ErrorClass::Transient, record.retry_count, record.max_retries)
            {
                RetryDecision::Retry { delay } => {
                    // Push first; on failure the record stays Processing
                    // and the next scan picks it up again.
                    self.queue.push(task.clone(), delay).await?;
                    record.requeue_for_retry();
                    let retry_count = record.retry_count;
                    drop(records);

                    self.publisher
                        .publish(
                            &task,
                            TaskEventKind::Requeued {
                                retry_count,
                                delay_ms: delay.as_millis() as u64,
                            },
                        )
                        .await;
                    metrics::record_retry(ErrorClass::Transient.as_str());
                }
                RetryDecision::GiveUp => {
                    let error = TaskError::transient(
                        "WORKER_LOST",
                        "Worker stopped renewing its lease and the retry budget is exhausted",
                    );
                    record.fail(error.clone());
                    record.archive();
                    let snapshot = record.clone();
                    drop(records);

                    metrics::record_dead_lettered(&error.code);
                    self.finalize(&snapshot, TaskEventKind::Failed { error }).await;
                }
            }
        }
        Ok(reaped)
    }

    // -------------------------------------------------------------------
    // Dead-letter administration
    // -------------------------------------------------------------------

    /// List dead-lettered tasks matching the filter.
    pub async fn list_dead_lettered(&self, filter: &DeadLetterFilter) -> Vec<TaskRecord> {
        let records = self.records.read().await;
        let mut hits: Vec<TaskRecord> = records
            .values()
            .filter(|r| r.status == TaskStatus::Failed)
            .filter(|r| match &filter.error_code {
                Some(code) => r.error.as_ref().map(|e| &e.code) == Some(code),
                None => true,
            })
            .filter(|r| match filter.failed_after {
                Some(after) => r.completed_at.map(|t| t >= after).unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.completed_at);
        hits
    }

    /// Operator-triggered requeue out of the dead-letter sink: resets the
    /// retry budget and re-enters `Queued`.
    pub async fn requeue(&self, task: &TaskId) -> EngineResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task)
            .ok_or_else(|| EngineError::TaskNotFound(task.clone()))?;
        if record.status != TaskStatus::Failed {
            return Err(EngineError::InvalidTransition {
                from: record.status,
                to: TaskStatus::Queued,
            });
        }

        // Reopen the event channel and enqueue before touching the record;
        // a failed push leaves the task in the dead-letter sink where the
        // operator can retry the requeue.
        self.publisher.reopen(task).await;
        self.queue.push(task.clone(), Duration::ZERO).await?;
        record.reset_for_requeue();
        let key = record.input.idempotency_key.clone();
        drop(records);

        if let Some(key) = key {
            self.dedup.lock().await.insert(key, task.clone());
        }
        self.publisher.publish(task, TaskEventKind::Queued).await;
        metrics::record_requeued();
        info!(task_id = %task, "Dead-lettered task requeued by operator");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    /// Reject any worker-originated update unless the caller holds the
    /// live lease; a cached "processing" flag is never trusted.
    async fn verify_lease(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        status: TaskStatus,
    ) -> EngineResult<()> {
        if status != TaskStatus::Processing {
            return Err(EngineError::LeaseExpired { task: task.clone() });
        }
        let lease = self.leases.get(task).await?;
        match lease {
            Some(lease) if lease.is_held_by(worker, Utc::now()) => Ok(()),
            _ => Err(EngineError::LeaseExpired { task: task.clone() }),
        }
    }

    /// Terminal-transition bookkeeping shared by every terminal path.
    async fn finalize(&self, snapshot: &TaskRecord, event: TaskEventKind) {
        if let Err(e) = self.checkpoints.clear(&snapshot.id).await {
            warn!(task_id = %snapshot.id, "Failed to clear checkpoint: {}", e);
        }
        // Failed channels stay resident: an operator requeue continues the
        // sequence counter. Completed and cancelled tasks never reopen.
        let retire_channel = !matches!(event, TaskEventKind::Failed { .. });
        self.publisher.publish(&snapshot.id, event).await;
        if retire_channel {
            self.publisher.retire(&snapshot.id).await;
        }

        let duration_secs = snapshot
            .completed_at
            .map(|done| (done - snapshot.created_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        metrics::record_finished(snapshot.status.as_str(), duration_secs);

        if let Some(store) = &self.record_store {
            if let Err(e) = store.save(snapshot).await {
                warn!(task_id = %snapshot.id, "Failed to archive record snapshot: {}", e);
            }
        }
        self.clear_dedup(snapshot).await;
    }

    /// Free the idempotency key once its task is terminal.
    async fn clear_dedup(&self, record: &TaskRecord) {
        if let Some(key) = &record.input.idempotency_key {
            let mut dedup = self.dedup.lock().await;
            if dedup.get(key) == Some(&record.id) {
                dedup.remove(key);
            }
        }
    }
}
