//! Codec engine seam and the shell-command implementation.
//!
//! The runner drives a task through a `CodecEngine`, which does the actual
//! media work and reports progress through the handle it is given. Report
//! results carry the cancellation flag back; a cooperative engine stops
//! promptly and returns the cancelled error.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use renderq_engine::AcquiredTask;
use renderq_models::{Checkpoint, TaskError};

/// Outcome of a progress report, as seen by the codec engine.
#[derive(Debug, Clone, Copy)]
pub struct ReportOutcome {
    /// The orchestrator has flagged this task for cancellation
    pub cancel_requested: bool,
}

/// Progress reporting surface handed to the codec engine.
///
/// An `Err` means the attempt is no longer admissible (lease expired or
/// lost); the engine must stop immediately without further reports.
#[async_trait]
pub trait ProgressHandle: Send + Sync {
    async fn report(
        &self,
        progress: u8,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ReportOutcome, TaskError>;
}

/// Performs the media work for one task attempt.
#[async_trait]
pub trait CodecEngine: Send + Sync {
    /// Process the task, resuming from `task.checkpoint` when present.
    /// On success, returns the output reference to record on the task.
    async fn process(
        &self,
        task: &AcquiredTask,
        progress: &dyn ProgressHandle,
    ) -> Result<Option<String>, TaskError>;
}

/// Codec engine that shells out to an external transcoder.
///
/// Protocol: the command receives the source URL, the output preset, and
/// optionally `--resume <token>`. It prints lines of the form
/// `progress <percent> [checkpoint <token>]` on stdout, and on success a
/// final `output <reference>` naming where the rendered media landed.
/// Exit code 0 is success; exit code 2 marks input the codec can never
/// process.
pub struct ShellCodecEngine {
    command: std::path::PathBuf,
}

impl ShellCodecEngine {
    /// Resolve the codec command on PATH.
    pub fn new(command: &str) -> Result<Self, TaskError> {
        let command = which::which(command).map_err(|e| {
            TaskError::permanent(
                "CODEC_MISSING",
                format!("codec command '{command}' not found: {e}"),
            )
        })?;
        Ok(Self { command })
    }

    fn parse_progress_line(line: &str) -> Option<(u8, Option<String>)> {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("progress") {
            return None;
        }
        let percent: u8 = parts.next()?.parse().ok()?;
        let token = match (parts.next(), parts.next()) {
            (Some("checkpoint"), Some(token)) => Some(token.to_string()),
            _ => None,
        };
        Some((percent.min(100), token))
    }

    fn parse_output_line(line: &str) -> Option<String> {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("output") {
            return None;
        }
        parts.next().map(str::to_string)
    }
}

#[async_trait]
impl CodecEngine for ShellCodecEngine {
    async fn process(
        &self,
        task: &AcquiredTask,
        progress: &dyn ProgressHandle,
    ) -> Result<Option<String>, TaskError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg(&task.input.source_url)
            .arg(&task.input.output_preset)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        // Resume tokens are opaque to us; the codec minted them
        let mut checkpoint_seq = if let Some(cp) = &task.checkpoint {
            if let Ok(token) = std::str::from_utf8(&cp.payload) {
                cmd.arg("--resume").arg(token);
            }
            cp.seq
        } else {
            0
        };

        let mut child = cmd.spawn().map_err(|e| {
            TaskError::transient("CODEC_SPAWN_FAILED", format!("failed to start codec: {e}"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TaskError::transient("CODEC_SPAWN_FAILED", "codec stdout not captured")
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let mut output = None;
        while let Some(line) = lines.next_line().await.map_err(|e| {
            TaskError::transient("CODEC_IO", format!("failed reading codec output: {e}"))
        })? {
            if let Some(reference) = Self::parse_output_line(&line) {
                output = Some(reference);
                continue;
            }
            let Some((percent, token)) = Self::parse_progress_line(&line) else {
                debug!(task_id = %task.task_id, line, "Ignoring codec output line");
                continue;
            };

            let checkpoint = token.map(|t| {
                checkpoint_seq += 1;
                Checkpoint::new(checkpoint_seq, t.into_bytes())
            });
            let outcome = progress.report(percent, checkpoint).await?;
            if outcome.cancel_requested {
                warn!(task_id = %task.task_id, "Cancellation observed, stopping codec");
                child.kill().await.ok();
                return Err(TaskError::cancelled());
            }
        }

        let status = child.wait().await.map_err(|e| {
            TaskError::transient("CODEC_IO", format!("failed waiting for codec: {e}"))
        })?;

        if status.success() {
            Ok(output)
        } else if status.code() == Some(2) {
            Err(TaskError::permanent(
                "UNSUPPORTED_CODEC",
                format!("codec rejected input ({status})"),
            ))
        } else {
            Err(TaskError::retriable(
                "CODEC_FAILED",
                format!("codec exited with {status}"),
            ))
        }
    }
}
