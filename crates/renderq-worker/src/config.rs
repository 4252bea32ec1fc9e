//! Worker configuration.

use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent tasks
    pub max_concurrent_tasks: usize,
    /// How long one queue poll blocks waiting for a ready task
    pub poll_timeout: Duration,
    /// Interval for renewing the task lease while processing; must be well
    /// under the engine's lease ttl
    pub heartbeat_interval: Duration,
    /// Graceful shutdown timeout for in-flight tasks
    pub shutdown_timeout: Duration,
    /// Codec command invoked per task (must be on PATH)
    pub codec_command: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            poll_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            codec_command: "ffmpeg-preset".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_tasks: std::env::var("WORKER_MAX_TASKS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            poll_timeout: Duration::from_secs(
                std::env::var("WORKER_POLL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            codec_command: std::env::var("WORKER_CODEC_COMMAND")
                .unwrap_or_else(|_| "ffmpeg-preset".to_string()),
        }
    }
}
