//! End-to-end orchestrator scenarios over the in-process backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use renderq_engine::{
    EngineConfig, EngineError, EngineResult, EventSink, MemoryCheckpointStore, MemoryLeaseStore,
    MemoryQueue, MemoryRecordStore, Orchestrator, RecordStore, TaskQueue,
};
use renderq_models::{
    Checkpoint, TaskError, TaskEvent, TaskEventKind, TaskId, TaskInput, TaskRecord, TaskStatus,
    WorkerId,
};

/// Config with near-zero delays so scenarios run in milliseconds.
fn fast_config() -> EngineConfig {
    EngineConfig {
        default_max_retries: 3,
        lease_ttl: Duration::from_secs(60),
        reaper_interval: Duration::from_millis(10),
        retry_base: Duration::from_millis(1),
        retry_cap: Duration::from_millis(5),
        progress_interval: Duration::from_millis(20),
        event_retry_delay: Duration::from_millis(5),
        event_retry_cap: Duration::from_millis(20),
    }
}

fn engine() -> Arc<Orchestrator> {
    Arc::new(Orchestrator::in_memory(fast_config()))
}

fn input() -> TaskInput {
    TaskInput::new("https://cdn.example.com/in.mp4", "h264_1080p")
}

struct CollectingSink {
    id: String,
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingSink {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    async fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &TaskEvent) -> EngineResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Queue wrapper whose next pushes can be made to fail on demand.
struct FlakyQueue {
    inner: MemoryQueue,
    fail_pushes: AtomicU32,
}

impl FlakyQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryQueue::new(),
            fail_pushes: AtomicU32::new(0),
        })
    }

    fn fail_next_pushes(&self, count: u32) {
        self.fail_pushes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskQueue for FlakyQueue {
    async fn push(&self, task: TaskId, delay: Duration) -> EngineResult<()> {
        let remaining = self.fail_pushes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_pushes.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::backend("queue write refused"));
        }
        self.inner.push(task, delay).await
    }

    async fn pop_ready(&self, timeout: Duration) -> EngineResult<Option<TaskId>> {
        self.inner.pop_ready(timeout).await
    }

    async fn remove(&self, task: &TaskId) -> EngineResult<bool> {
        self.inner.remove(task).await
    }

    async fn len(&self) -> EngineResult<usize> {
        self.inner.len().await
    }
}

fn engine_over(config: EngineConfig, queue: Arc<dyn TaskQueue>) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        config,
        queue,
        Arc::new(MemoryLeaseStore::new()),
        Arc::new(MemoryCheckpointStore::new()),
    ))
}

/// Drive a task from submission to worker acquisition.
async fn submit_and_acquire(
    engine: &Orchestrator,
    input: TaskInput,
    worker: &WorkerId,
) -> (TaskId, renderq_engine::AcquiredTask) {
    let task = engine.submit(input).await.unwrap();
    let acquired = engine
        .next_task(worker, Duration::from_millis(100))
        .await
        .unwrap()
        .expect("task should be ready");
    assert_eq!(acquired.task_id, task);
    (task, acquired)
}

#[tokio::test]
async fn test_happy_path_to_completed() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let sink = CollectingSink::new("s1");

    let task = engine.submit(input()).await.unwrap();
    engine.subscribe(&task, sink.clone()).await.unwrap();

    let acquired = engine
        .next_task(&worker, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acquired.attempt, 0);
    assert!(acquired.checkpoint.is_none());

    let ack = engine
        .report_progress(&task, &worker, 40, Some(Checkpoint::new(1, b"frame-400".to_vec())))
        .await
        .unwrap();
    assert_eq!(ack.progress, 40);
    assert!(!ack.cancel_requested);

    engine
        .report_success(&task, &worker, Some("clips/out-1080p.mp4".to_string()))
        .await
        .unwrap();

    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.result.as_deref(), Some("clips/out-1080p.mp4"));
    assert!(record.completed_at.is_some());
    assert!(record.lease_owner.is_none());

    // Exactly one terminal event, sequences strictly increasing
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = sink.events().await;
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        TaskEventKind::Completed { result: Some(r) } if r == "clips/out-1080p.mp4"
    )));
    let mut seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let sorted = {
        let mut s = seqs.clone();
        s.sort_unstable();
        s.dedup();
        s
    };
    seqs.sort_unstable();
    assert_eq!(seqs, sorted, "duplicate sequence numbers delivered");
}

#[tokio::test]
async fn test_permanent_error_dead_letters_without_retry() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let task_input = input().with_max_retries(0);

    let (task, _) = submit_and_acquire(&engine, task_input, &worker).await;
    engine
        .report_failure(
            &task,
            &worker,
            TaskError::permanent("UNSUPPORTED_CODEC", "codec not supported"),
        )
        .await
        .unwrap();

    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error.as_ref().unwrap().code, "UNSUPPORTED_CODEC");

    // Permanent failures skip the queue even with budget left
    let engine2 = engine.clone();
    let (task2, _) = submit_and_acquire(&engine2, input(), &worker).await;
    engine2
        .report_failure(
            &task2,
            &worker,
            TaskError::permanent("UNSUPPORTED_CODEC", "codec not supported"),
        )
        .await
        .unwrap();
    assert_eq!(
        engine2.get_status(&task2).await.unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_retriable_failures_requeue_then_exhaust() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let task = engine.submit(input().with_max_retries(2)).await.unwrap();

    for expected_attempt in 0..=2u32 {
        let acquired = engine
            .next_task(&worker, Duration::from_millis(500))
            .await
            .unwrap()
            .expect("retry should re-enter the queue");
        assert_eq!(acquired.attempt, expected_attempt);
        engine
            .report_failure(
                &task,
                &worker,
                TaskError::retriable("UPSTREAM_TIMEOUT", "origin fetch timed out"),
            )
            .await
            .unwrap();
    }

    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.error.as_ref().unwrap().code, "UPSTREAM_TIMEOUT");

    // Nothing left to hand out
    let next = engine
        .next_task(&worker, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_checkpoint_survives_retry_and_resumes() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let task = engine.submit(input()).await.unwrap();

    let first = engine
        .next_task(&worker, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert!(first.checkpoint.is_none());

    engine
        .report_progress(&task, &worker, 60, Some(Checkpoint::new(3, b"segment-6".to_vec())))
        .await
        .unwrap();
    engine
        .report_failure(
            &task,
            &worker,
            TaskError::transient("STORAGE_FLAKE", "write failed"),
        )
        .await
        .unwrap();

    // Progress reset to 0 on requeue, checkpoint retained
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert_eq!(record.progress, 0);
    assert_eq!(record.checkpoint_seq, Some(3));

    let second = engine
        .next_task(&worker, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.attempt, 1);
    let cp = second.checkpoint.expect("resume point should be offered");
    assert_eq!(cp.seq, 3);
    assert_eq!(cp.payload, b"segment-6".to_vec());
}

#[tokio::test]
async fn test_stale_checkpoint_write_is_ignored() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;

    engine
        .report_progress(&task, &worker, 50, Some(Checkpoint::new(5, b"five".to_vec())))
        .await
        .unwrap();
    // Duplicate report from a slower path carries an older seq; the write
    // is dropped but the report itself still succeeds
    let ack = engine
        .report_progress(&task, &worker, 55, Some(Checkpoint::new(4, b"four".to_vec())))
        .await
        .unwrap();
    assert_eq!(ack.progress, 55);

    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.checkpoint_seq, Some(5));
}

#[tokio::test]
async fn test_exactly_one_acquire_winner() {
    let engine = engine();
    let task = engine.submit(input()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        let task = task.clone();
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::from_string(format!("w{i}"));
            engine.acquire(&task, &worker).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::AlreadyLeased { .. }) => {}
            Err(e) => panic!("unexpected acquire error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_expired_worker_cannot_report() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let intruder = WorkerId::from_string("w2");
    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;

    // A non-holder is rejected outright
    let err = engine
        .report_progress(&task, &intruder, 10, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeaseExpired { .. }));

    let err = engine
        .report_success(&task, &intruder, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeaseExpired { .. }));

    // The holder is unaffected
    engine.report_progress(&task, &worker, 10, None).await.unwrap();
}

#[tokio::test]
async fn test_reaper_requeues_orphaned_task() {
    let mut config = fast_config();
    config.lease_ttl = Duration::from_millis(20);
    let engine = Arc::new(Orchestrator::in_memory(config));
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let reaped = engine.reap_expired().await.unwrap();
    assert_eq!(reaped, 1);

    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert_eq!(record.retry_count, 1);

    // The orphan is redeliverable to another worker
    let rescuer = WorkerId::from_string("w2");
    let acquired = engine
        .next_task(&rescuer, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acquired.task_id, task);
    assert_eq!(acquired.attempt, 1);
}

#[tokio::test]
async fn test_renew_keeps_lease_alive() {
    let mut config = fast_config();
    config.lease_ttl = Duration::from_millis(60);
    let engine = Arc::new(Orchestrator::in_memory(config));
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.renew_lease(&task, &worker).await.unwrap();
    }

    // Well past the original ttl, but renewals kept it live
    assert_eq!(engine.reap_expired().await.unwrap(), 0);
    engine.report_success(&task, &worker, None).await.unwrap();
}

#[tokio::test]
async fn test_cancel_while_queued_is_immediate() {
    let engine = engine();
    let sink = CollectingSink::new("s1");

    let task = engine.submit(input()).await.unwrap();
    engine.subscribe(&task, sink.clone()).await.unwrap();
    engine.cancel(&task).await.unwrap();

    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);

    // Never handed to a worker
    let worker = WorkerId::from_string("w1");
    let next = engine
        .next_task(&worker, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(next.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = sink.events().await;
    assert!(events
        .iter()
        .any(|e| e.kind == TaskEventKind::Cancelled));
}

#[tokio::test]
async fn test_cancel_while_processing_is_cooperative() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;

    engine.cancel(&task).await.unwrap();

    // Still processing until the worker acknowledges
    assert_eq!(
        engine.get_status(&task).await.unwrap().status,
        TaskStatus::Processing
    );

    let ack = engine.report_progress(&task, &worker, 30, None).await.unwrap();
    assert!(ack.cancel_requested);

    engine
        .report_failure(&task, &worker, TaskError::cancelled())
        .await
        .unwrap();
    assert_eq!(
        engine.get_status(&task).await.unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_terminal_task_rejected() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");
    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;
    engine.report_success(&task, &worker, None).await.unwrap();

    let err = engine.cancel(&task).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable { .. }));
}

#[tokio::test]
async fn test_duplicate_idempotency_key_rejected_while_live() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");

    let first = engine
        .submit(input().with_idempotency_key("upload-42"))
        .await
        .unwrap();
    let err = engine
        .submit(input().with_idempotency_key("upload-42"))
        .await
        .unwrap_err();
    match err {
        EngineError::DuplicateTask { existing } => assert_eq!(existing, first),
        other => panic!("expected DuplicateTask, got {other}"),
    }

    // Once the first task is terminal the key is free again
    let acquired = engine
        .next_task(&worker, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    engine
        .report_success(&acquired.task_id, &worker, None)
        .await
        .unwrap();

    engine
        .submit(input().with_idempotency_key("upload-42"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dead_letter_listing_and_requeue() {
    let engine = engine();
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input().with_max_retries(0), &worker).await;
    engine
        .report_failure(
            &task,
            &worker,
            TaskError::permanent("UNSUPPORTED_CODEC", "codec not supported"),
        )
        .await
        .unwrap();

    let hits = engine
        .list_dead_lettered(&renderq_engine::DeadLetterFilter {
            error_code: Some("UNSUPPORTED_CODEC".to_string()),
            failed_after: None,
        })
        .await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, task);

    let misses = engine
        .list_dead_lettered(&renderq_engine::DeadLetterFilter {
            error_code: Some("OTHER_CODE".to_string()),
            failed_after: None,
        })
        .await;
    assert!(misses.is_empty());

    // Operator requeue resets the budget and re-enters the queue
    engine.requeue(&task).await.unwrap();
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert_eq!(record.retry_count, 0);
    assert!(record.error.is_none());

    let acquired = engine
        .next_task(&worker, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acquired.task_id, task);
    engine.report_success(&task, &worker, None).await.unwrap();
}

#[tokio::test]
async fn test_requeue_rejected_unless_failed() {
    let engine = engine();
    let task = engine.submit(input()).await.unwrap();

    let err = engine.requeue(&task).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_submit_rejects_invalid_input() {
    let engine = engine();

    let err = engine
        .submit(TaskInput::new("not a url", "h264_1080p"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .submit(TaskInput::new("https://cdn.example.com/in.mp4", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_requeue_push_failure_never_strands_the_record() {
    let queue = FlakyQueue::new();
    let engine = engine_over(fast_config(), queue.clone());
    let worker = WorkerId::from_string("w1");
    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;

    queue.fail_next_pushes(1);
    let err = engine
        .report_failure(
            &task,
            &worker,
            TaskError::transient("STORAGE_FLAKE", "write failed"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));

    // The record was not advanced: still Processing, budget untouched,
    // nothing half-enqueued
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Processing);
    assert_eq!(record.retry_count, 0);
    assert_eq!(queue.len().await.unwrap(), 0);

    // The lease was already released, so the next reaper scan reclaims it
    assert_eq!(engine.reap_expired().await.unwrap(), 1);
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert_eq!(record.retry_count, 1);

    let rescuer = WorkerId::from_string("w2");
    let acquired = engine
        .next_task(&rescuer, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acquired.task_id, task);
}

#[tokio::test]
async fn test_reaper_push_failure_retries_on_next_scan() {
    let mut config = fast_config();
    config.lease_ttl = Duration::from_millis(20);
    let queue = FlakyQueue::new();
    let engine = engine_over(config, queue.clone());
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    queue.fail_next_pushes(1);
    assert!(engine.reap_expired().await.is_err());
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Processing);
    assert_eq!(queue.len().await.unwrap(), 0);

    // The record stayed Processing, so the next scan picks it up again
    assert_eq!(engine.reap_expired().await.unwrap(), 1);
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Queued);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn test_operator_requeue_push_failure_keeps_dead_letter() {
    let queue = FlakyQueue::new();
    let engine = engine_over(fast_config(), queue.clone());
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input().with_max_retries(0), &worker).await;
    engine
        .report_failure(
            &task,
            &worker,
            TaskError::retriable("CODEC_FAILED", "codec exited with 1"),
        )
        .await
        .unwrap();
    assert_eq!(
        engine.get_status(&task).await.unwrap().status,
        TaskStatus::Failed
    );

    queue.fail_next_pushes(1);
    let err = engine.requeue(&task).await.unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));

    // Still dead-lettered, error intact; the operator can simply retry
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.is_some());

    engine.requeue(&task).await.unwrap();
    assert_eq!(
        engine.get_status(&task).await.unwrap().status,
        TaskStatus::Queued
    );
}

#[tokio::test]
async fn test_unknown_queue_delivery_is_requeued_not_consumed() {
    let queue = Arc::new(MemoryQueue::new());
    let engine = engine_over(fast_config(), queue.clone());
    let worker = WorkerId::from_string("w1");

    // An id enqueued by another process sharing the queue backend
    queue
        .push(TaskId::from_string("foreign-task"), Duration::ZERO)
        .await
        .unwrap();
    let task = engine.submit(input()).await.unwrap();

    let acquired = engine
        .next_task(&worker, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acquired.task_id, task);

    // The foreign id went back on the queue with a delay instead of being
    // silently dropped
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_terminal_snapshots_archived_to_record_store() {
    let store = Arc::new(MemoryRecordStore::new());
    let engine = Arc::new(Orchestrator::in_memory(fast_config()).with_record_store(store.clone()));
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;
    engine
        .report_success(&task, &worker, Some("clips/out.mp4".to_string()))
        .await
        .unwrap();

    let snapshot = store
        .load(&task)
        .await
        .unwrap()
        .expect("completed snapshot should be archived");
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.result.as_deref(), Some("clips/out.mp4"));
    assert!(snapshot.checkpoint_seq.is_none());

    // Dead-lettered tasks are archived too
    let (task2, _) = submit_and_acquire(&engine, input().with_max_retries(0), &worker).await;
    engine
        .report_failure(
            &task2,
            &worker,
            TaskError::permanent("UNSUPPORTED_CODEC", "codec rejected input"),
        )
        .await
        .unwrap();
    let snapshot = store.load(&task2).await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.error.unwrap().code, "UNSUPPORTED_CODEC");
}

/// Audit store that refuses every write.
struct RejectingStore;

#[async_trait]
impl RecordStore for RejectingStore {
    async fn save(&self, _record: &TaskRecord) -> EngineResult<()> {
        Err(EngineError::backend("audit store offline"))
    }

    async fn load(&self, _task: &TaskId) -> EngineResult<Option<TaskRecord>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_record_store_failure_does_not_block_completion() {
    let engine =
        Arc::new(Orchestrator::in_memory(fast_config()).with_record_store(Arc::new(RejectingStore)));
    let worker = WorkerId::from_string("w1");

    let (task, _) = submit_and_acquire(&engine, input(), &worker).await;
    engine.report_success(&task, &worker, None).await.unwrap();

    // Archival is best-effort; the terminal transition stands
    let record = engine.get_status(&task).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_subscribe_unknown_task_fails() {
    let engine = engine();
    let sink = CollectingSink::new("s1");
    let err = engine
        .subscribe(&TaskId::from_string("missing"), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TaskNotFound(_)));
}
