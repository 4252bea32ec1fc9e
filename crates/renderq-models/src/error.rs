//! Typed task failure descriptors.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a task failure, driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Never retried (e.g. unsupported input format)
    Permanent,
    /// Retried up to the task's retry budget
    Retriable,
    /// Retried; counts toward the budget but not toward hard-failure alerting
    Transient,
    /// Worker observed the cancellation flag and stopped
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Permanent => "permanent",
            ErrorClass::Retriable => "retriable",
            ErrorClass::Transient => "transient",
            ErrorClass::Cancelled => "cancelled",
        }
    }

    /// Check if failures of this class may re-enter the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retriable | ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured task failure: a stable machine code plus a human-readable
/// message, persisted on the record when the task ends up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    /// Failure classification
    pub class: ErrorClass,
    /// Stable machine-readable code (e.g. "UNSUPPORTED_CODEC")
    pub code: String,
    /// Human-readable description
    pub message: String,
}

impl TaskError {
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a permanent (never retried) error.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, code, message)
    }

    /// Create a retriable error.
    pub fn retriable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retriable, code, message)
    }

    /// Create a transient error (retried, softer alerting).
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, code, message)
    }

    /// Create the error a worker reports after observing cancellation.
    pub fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "CANCELLED", "Task cancelled by request")
    }

    /// Check if this error may re-enter the queue.
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.class, self.code, self.message)
    }
}
