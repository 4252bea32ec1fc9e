//! Core task orchestration engine.
//!
//! Owns the task lifecycle: submission, leased dispatch, progress and
//! checkpoint tracking, retry with exponential backoff, dead-lettering,
//! cancellation, and event fan-out. Storage and transport are pluggable
//! through the backend traits; in-process implementations back tests and
//! single-node deployments.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod store;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use lease::{LeaseStore, MemoryLeaseStore};
pub use logging::TaskLogger;
pub use orchestrator::{AcquiredTask, DeadLetterFilter, Orchestrator, ProgressAck};
pub use publisher::{EventPublisher, EventSink};
pub use queue::{MemoryQueue, TaskQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{MemoryRecordStore, RecordStore};
