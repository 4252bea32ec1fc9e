//! Ready-time ordered task queue with delayed re-delivery.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use renderq_models::TaskId;

use crate::error::EngineResult;

/// Queue of task identifiers ready for pickup, ordered by readiness time.
///
/// Delivery is at-least-once: a popped identifier may race with another
/// consumer, and the loser is rejected at `acquire` time.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task, visible after `delay`.
    async fn push(&self, task: TaskId, delay: Duration) -> EngineResult<()>;

    /// Pop the next ready task, waiting up to `timeout` for one to become
    /// ready. Returns `None` on timeout.
    async fn pop_ready(&self, timeout: Duration) -> EngineResult<Option<TaskId>>;

    /// Remove a not-yet-delivered task (cancellation while queued).
    /// Returns `true` if the task was present.
    async fn remove(&self, task: &TaskId) -> EngineResult<bool>;

    /// Number of tasks currently queued (ready or delayed).
    async fn len(&self) -> EngineResult<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    ready_at: DateTime<Utc>,
    // FIFO tie-break for equal readiness times
    insert_seq: u64,
    task: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ready_at, self.insert_seq, &self.task).cmp(&(
            other.ready_at,
            other.insert_seq,
            &other.task,
        ))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct MemoryQueueState {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    insert_seq: u64,
}

/// In-process queue backend: binary heap keyed by ready time.
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Pop the first ready entry, or report when the next entry becomes
    /// ready.
    async fn try_pop(&self) -> (Option<TaskId>, Option<DateTime<Utc>>) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(Reverse(entry)) = state.heap.peek() {
            if entry.ready_at > now {
                return (None, Some(entry.ready_at));
            }
        }
        let popped = state.heap.pop().map(|Reverse(entry)| entry.task);
        (popped, None)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task: TaskId, delay: Duration) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.insert_seq += 1;
        let entry = QueueEntry {
            ready_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            insert_seq: state.insert_seq,
            task: task.clone(),
        };
        state.heap.push(Reverse(entry));
        drop(state);

        debug!(task_id = %task, delay_ms = delay.as_millis() as u64, "Task enqueued");
        self.notify.notify_one();
        Ok(())
    }

    async fn pop_ready(&self, timeout: Duration) -> EngineResult<Option<TaskId>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for wakeups before checking so a concurrent push is
            // not missed.
            let notified = self.notify.notified();

            let (popped, next_ready) = self.try_pop().await;
            if let Some(task) = popped {
                return Ok(Some(task));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut wait_until = deadline;
            if let Some(ready_at) = next_ready {
                let until_ready = (ready_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                wait_until = wait_until.min(now + until_ready);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }
    }

    async fn remove(&self, task: &TaskId) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.heap.len();
        // Queues are small per process; an eager rebuild keeps pop simple.
        let kept: BinaryHeap<_> = state
            .heap
            .drain()
            .filter(|Reverse(e)| e.task != *task)
            .collect();
        state.heap = kept;
        Ok(state.heap.len() < before)
    }

    async fn len(&self) -> EngineResult<usize> {
        Ok(self.state.lock().await.heap.len())
    }
}
