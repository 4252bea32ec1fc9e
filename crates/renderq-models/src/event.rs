//! Lifecycle and progress event envelopes.
//!
//! Events are delivered at-least-once; subscribers de-duplicate on
//! `(task_id, kind, seq)` rather than assuming exactly-once transport.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::task::{TaskId, WorkerId};

/// Kind of lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Task accepted and enqueued
    Queued,

    /// A worker acquired the task
    Started {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
    },

    /// Progress update (0-100)
    Progress {
        value: u8,
        /// Sequence of the checkpoint saved with this report, if any
        #[serde(skip_serializing_if = "Option::is_none", rename = "checkpointSeq")]
        checkpoint_seq: Option<u64>,
    },

    /// Task re-entered the queue after a retriable failure
    Requeued {
        #[serde(rename = "retryCount")]
        retry_count: u32,
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },

    /// Task completed successfully
    Completed {
        /// Worker-reported output reference (e.g. the rendered object key)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },

    /// Task failed terminally
    Failed { error: TaskError },

    /// Task was cancelled
    Cancelled,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Queued => "queued",
            TaskEventKind::Started { .. } => "started",
            TaskEventKind::Progress { .. } => "progress",
            TaskEventKind::Requeued { .. } => "requeued",
            TaskEventKind::Completed { .. } => "completed",
            TaskEventKind::Failed { .. } => "failed",
            TaskEventKind::Cancelled => "cancelled",
        }
    }

    /// Terminal events are never dropped and are redelivered until
    /// acknowledged.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventKind::Completed { .. }
                | TaskEventKind::Failed { .. }
                | TaskEventKind::Cancelled
        )
    }

    /// Progress events may be coalesced by the rate limiter; only the
    /// latest value matters.
    pub fn is_progress(&self) -> bool {
        matches!(self, TaskEventKind::Progress { .. })
    }
}

/// Event envelope pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskEvent {
    /// Task this event belongs to
    pub task_id: TaskId,
    /// Per-task monotonic sequence number (de-duplication key)
    pub seq: u64,
    /// Event payload
    #[serde(flatten)]
    pub kind: TaskEventKind,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task_id: TaskId, seq: u64, kind: TaskEventKind) -> Self {
        Self {
            task_id,
            seq,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = TaskEvent::new(
            TaskId::from_string("t1"),
            3,
            TaskEventKind::Progress {
                value: 40,
                checkpoint_seq: Some(2),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"value\":40"));
        assert!(json.contains("\"seq\":3"));
        assert!(json.contains("\"checkpointSeq\":2"));
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(TaskEventKind::Completed { result: None }.is_terminal());
        assert!(TaskEventKind::Cancelled.is_terminal());
        assert!(TaskEventKind::Failed {
            error: crate::TaskError::permanent("X", "x")
        }
        .is_terminal());
        assert!(!TaskEventKind::Queued.is_terminal());
        assert!(!TaskEventKind::Progress {
            value: 10,
            checkpoint_seq: None
        }
        .is_terminal());
    }

    #[test]
    fn test_roundtrip() {
        let event = TaskEvent::new(
            TaskId::from_string("t1"),
            1,
            TaskEventKind::Completed {
                result: Some("clips/t1/out.mp4".to_string()),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"result\":\"clips/t1/out.mp4\""));
        let back: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
