//! Validated task submission input.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Submission payload for a video-processing task.
///
/// Validated at submission time; malformed input is rejected before a
/// record is created.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct TaskInput {
    /// Source media location (blob-store or http URL)
    #[validate(url(message = "source_url must be a valid URL"))]
    pub source_url: String,

    /// Output encoding preset name (e.g. "h264_1080p")
    #[validate(length(min = 1, message = "output_preset must not be empty"))]
    pub output_preset: String,

    /// Optional per-task retry budget override
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(max = 10, message = "max_retries must be at most 10"))]
    pub max_retries: Option<u32>,

    /// Optional deduplication key: a second submission with the same key
    /// while the first task is still live is rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl TaskInput {
    /// Create an input with the required fields.
    pub fn new(source_url: impl Into<String>, output_preset: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            output_preset: output_preset.into(),
            max_retries: None,
            idempotency_key: None,
        }
    }

    /// Set the retry budget override.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the deduplication key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
