//! Task records and the lifecycle state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::TaskError;
use crate::input::TaskInput;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Generate a fresh worker identity.
    pub fn new() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle status.
///
/// Transitions: `Queued -> Processing -> {Completed | Failed}`,
/// `Processing -> Queued` on retriable failure, and `Queued | Processing ->
/// Cancelled` on cancellation. `Completed`, `Failed` and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting in the queue
    #[default]
    Queued,
    /// Task is owned by a worker under a live lease
    Processing,
    /// Task completed successfully
    Completed,
    /// Task failed with retries exhausted or a permanent error
    Failed,
    /// Task was cancelled by request
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no more transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check if a transition to `next` follows a legal state-machine edge.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-bounded exclusive ownership of a task by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Lease {
    /// Current holder
    pub owner: WorkerId,
    /// Lease deadline; past this instant the holder is treated as dead
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: WorkerId, expires_at: DateTime<Utc>) -> Self {
        Self { owner, expires_at }
    }

    /// Check if the lease is still live at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Check if `worker` holds this lease and it is still live.
    pub fn is_held_by(&self, worker: &WorkerId, now: DateTime<Utc>) -> bool {
        self.owner == *worker && self.is_live(now)
    }
}

/// Opaque, sequenced progress marker enabling resumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Checkpoint {
    /// Monotonically increasing sequence number supplied by the worker
    pub seq: u64,
    /// Worker-defined opaque payload
    pub payload: Vec<u8>,
}

impl Checkpoint {
    pub fn new(seq: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }
}

/// Durable representation of a task and its lifecycle state.
///
/// The orchestrator exclusively owns record mutation; workers propose
/// transitions through the orchestrator API and never write records
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskRecord {
    /// Unique task ID, immutable after creation
    pub id: TaskId,

    /// Submission payload
    pub input: TaskInput,

    /// Current lifecycle status
    pub status: TaskStatus,

    /// Progress percentage (0-100); 100 only when `Completed`
    #[serde(default)]
    pub progress: u8,

    /// Number of retry attempts consumed
    #[serde(default)]
    pub retry_count: u32,

    /// Retry budget
    pub max_retries: u32,

    /// Current lease holder (non-null iff `Processing`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<WorkerId>,

    /// Current lease deadline (non-null iff `Processing`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Sequence number of the last durably saved checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_seq: Option<u64>,

    /// Worker-reported output reference, set only when `Completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Failure descriptor, set only when `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Cancellation requested while `Processing`; observed by the worker
    /// on its next progress report
    #[serde(default)]
    pub cancel_requested: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// First acquisition timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal transition timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a new record in `Queued` from validated input.
    pub fn new(input: TaskInput, default_max_retries: u32) -> Self {
        let now = Utc::now();
        let max_retries = input.max_retries.unwrap_or(default_max_retries);
        Self {
            id: TaskId::new(),
            input,
            status: TaskStatus::Queued,
            progress: 0,
            retry_count: 0,
            max_retries,
            lease_owner: None,
            lease_expires_at: None,
            checkpoint_seq: None,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to `Processing` under the given lease.
    pub fn begin_processing(&mut self, worker: WorkerId, lease_expires_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = TaskStatus::Processing;
        self.lease_owner = Some(worker);
        self.lease_expires_at = Some(lease_expires_at);
        // started_at is set exactly once, on the first acquisition
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Update progress while `Processing`.
    ///
    /// Progress is monotonically non-decreasing and capped at 99: 100 is
    /// reserved for the completion transition. Late or duplicate reports
    /// with a lower value are clamped up to the current value.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(99));
        self.updated_at = Utc::now();
    }

    /// Renew the lease deadline.
    pub fn renew_lease(&mut self, lease_expires_at: DateTime<Utc>) {
        self.lease_expires_at = Some(lease_expires_at);
        self.updated_at = Utc::now();
    }

    /// Terminal success transition.
    pub fn complete(&mut self, result: Option<String>) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = result;
        self.clear_lease();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Terminal failure transition.
    pub fn fail(&mut self, error: TaskError) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.clear_lease();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Re-enter `Queued` for a retry attempt: progress resets to 0 and one
    /// unit of the retry budget is consumed. The checkpoint survives so the
    /// next attempt can resume.
    pub fn requeue_for_retry(&mut self) {
        self.status = TaskStatus::Queued;
        self.progress = 0;
        self.retry_count += 1;
        self.error = None;
        self.clear_lease();
        self.updated_at = Utc::now();
    }

    /// Terminal cancellation transition.
    pub fn cancel(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Cancelled;
        self.clear_lease();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Flag the task for cooperative cancellation.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.updated_at = Utc::now();
    }

    /// Reset for an operator-triggered requeue out of the dead-letter sink.
    pub fn reset_for_requeue(&mut self) {
        self.status = TaskStatus::Queued;
        self.progress = 0;
        self.retry_count = 0;
        self.result = None;
        self.error = None;
        self.cancel_requested = false;
        self.completed_at = None;
        self.clear_lease();
        self.updated_at = Utc::now();
    }

    /// Drop transient bookkeeping once terminal (lease and checkpoint
    /// fields); retention of the record itself is an external concern.
    pub fn archive(&mut self) {
        self.clear_lease();
        self.checkpoint_seq = None;
        self.cancel_requested = false;
        self.updated_at = Utc::now();
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// Check if the retry budget still has room.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::input::TaskInput;

    fn test_record() -> TaskRecord {
        TaskRecord::new(TaskInput::new("https://example.com/in.mp4", "h264_1080p"), 3)
    }

    #[test]
    fn test_record_creation() {
        let record = test_record();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.progress, 0);
        assert!(record.lease_owner.is_none());
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Queued));
        assert!(Processing.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Cancelled.can_transition_to(Queued));
    }

    #[test]
    fn test_lease_fields_track_processing() {
        let mut record = test_record();
        let worker = WorkerId::from_string("w1");
        let expires = Utc::now() + chrono::Duration::minutes(10);

        record.begin_processing(worker.clone(), expires);
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.lease_owner, Some(worker));
        assert!(record.started_at.is_some());

        record.complete(Some("clips/out.mp4".to_string()));
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.result.as_deref(), Some("clips/out.mp4"));
        assert!(record.lease_owner.is_none());
        assert!(record.lease_expires_at.is_none());
    }

    #[test]
    fn test_progress_monotonic_and_capped() {
        let mut record = test_record();
        record.begin_processing(WorkerId::from_string("w1"), Utc::now());

        record.set_progress(40);
        assert_eq!(record.progress, 40);

        // Late duplicate with a lower value does not regress
        record.set_progress(10);
        assert_eq!(record.progress, 40);

        // 100 is reserved for completion
        record.set_progress(100);
        assert_eq!(record.progress, 99);
    }

    #[test]
    fn test_retry_requeue_resets_progress() {
        let mut record = test_record();
        record.begin_processing(WorkerId::from_string("w1"), Utc::now());
        record.set_progress(70);

        record.requeue_for_retry();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.progress, 0);
        assert_eq!(record.retry_count, 1);
        assert!(record.lease_owner.is_none());
        assert!(record.has_retry_budget());
    }

    #[test]
    fn test_started_at_set_once() {
        let mut record = test_record();
        record.begin_processing(WorkerId::from_string("w1"), Utc::now());
        let first = record.started_at;

        record.requeue_for_retry();
        record.begin_processing(WorkerId::from_string("w2"), Utc::now());
        assert_eq!(record.started_at, first);
    }

    #[test]
    fn test_fail_records_error() {
        let mut record = test_record();
        record.begin_processing(WorkerId::from_string("w1"), Utc::now());
        record.fail(TaskError::permanent("UNSUPPORTED_CODEC", "bad input"));

        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.is_terminal());
        assert_eq!(record.error.as_ref().unwrap().code, "UNSUPPORTED_CODEC");
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_lease_liveness() {
        let now = Utc::now();
        let w = WorkerId::from_string("w1");
        let lease = Lease::new(w.clone(), now + chrono::Duration::minutes(10));

        assert!(lease.is_live(now));
        assert!(lease.is_held_by(&w, now));
        assert!(!lease.is_held_by(&WorkerId::from_string("w2"), now));
        assert!(!lease.is_live(now + chrono::Duration::minutes(11)));
    }
}
