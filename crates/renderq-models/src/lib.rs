//! Shared data models for the renderq orchestration engine.
//!
//! This crate provides Serde-serializable types for:
//! - Task records and the lifecycle state machine
//! - Typed task error classes
//! - Lifecycle/progress event envelopes
//! - Validated submission input

pub mod error;
pub mod event;
pub mod input;
pub mod task;

// Re-export common types
pub use error::{ErrorClass, TaskError};
pub use event::{TaskEvent, TaskEventKind};
pub use input::TaskInput;
pub use task::{Checkpoint, Lease, TaskId, TaskRecord, TaskStatus, WorkerId};
