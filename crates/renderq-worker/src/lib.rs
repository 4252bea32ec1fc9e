//! Worker harness for the renderq engine.
//!
//! This crate provides:
//! - A bounded-concurrency task runner with lease heartbeats
//! - The codec engine seam plus a shell-command implementation
//! - Retry utilities for flaky infrastructure calls

pub mod codec;
pub mod config;
pub mod error;
pub mod retry;
pub mod runner;

pub use codec::{CodecEngine, ProgressHandle, ReportOutcome, ShellCodecEngine};
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use retry::{retry_async, FailureTracker, RetryConfig};
pub use runner::TaskRunner;
