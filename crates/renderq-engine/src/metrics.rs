//! Engine metrics collection.
//!
//! Provides standardized metrics for monitoring the orchestrator:
//! - Lifecycle counters by outcome
//! - Dead-letter and reaper counters
//! - Task duration histogram

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Tasks accepted at submission.
    pub const TASKS_SUBMITTED_TOTAL: &str = "renderq_tasks_submitted_total";

    /// Tasks that reached a terminal state, by status.
    pub const TASKS_FINISHED_TOTAL: &str = "renderq_tasks_finished_total";

    /// Retry re-enqueues, by error class.
    pub const TASKS_RETRIED_TOTAL: &str = "renderq_tasks_retried_total";

    /// Tasks routed to the dead-letter sink.
    pub const TASKS_DEAD_LETTERED_TOTAL: &str = "renderq_tasks_dead_lettered_total";

    /// Operator-triggered requeues out of the dead-letter sink.
    pub const TASKS_REQUEUED_TOTAL: &str = "renderq_tasks_requeued_total";

    /// Expired leases reclaimed by the reaper.
    pub const LEASES_REAPED_TOTAL: &str = "renderq_leases_reaped_total";

    /// Checkpoint writes rejected as stale.
    pub const CHECKPOINTS_STALE_TOTAL: &str = "renderq_checkpoints_stale_total";

    /// Wall-clock duration from submission to terminal state, in seconds.
    pub const TASK_DURATION_SECONDS: &str = "renderq_task_duration_seconds";
}

/// Record a task submission.
pub fn record_submitted() {
    counter!(names::TASKS_SUBMITTED_TOTAL).increment(1);
}

/// Record a terminal transition and its end-to-end duration.
pub fn record_finished(status: &str, duration_secs: f64) {
    counter!(names::TASKS_FINISHED_TOTAL, "status" => status.to_string()).increment(1);
    histogram!(names::TASK_DURATION_SECONDS, "status" => status.to_string())
        .record(duration_secs);
}

/// Record a retry re-enqueue.
pub fn record_retry(class: &str) {
    counter!(names::TASKS_RETRIED_TOTAL, "class" => class.to_string()).increment(1);
}

/// Record a dead-letter routing.
pub fn record_dead_lettered(code: &str) {
    counter!(names::TASKS_DEAD_LETTERED_TOTAL, "code" => code.to_string()).increment(1);
}

/// Record an operator requeue.
pub fn record_requeued() {
    counter!(names::TASKS_REQUEUED_TOTAL).increment(1);
}

/// Record a lease reclaimed from a dead worker.
pub fn record_lease_reaped() {
    counter!(names::LEASES_REAPED_TOTAL).increment(1);
}

/// Record a rejected stale checkpoint write.
pub fn record_stale_checkpoint() {
    counter!(names::CHECKPOINTS_STALE_TOTAL).increment(1);
}
