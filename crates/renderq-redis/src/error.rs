//! Error mapping from Redis to the engine's backend error.

use renderq_engine::EngineError;

/// Convert a Redis failure into the engine's retryable backend error.
pub(crate) fn backend(e: redis::RedisError) -> EngineError {
    EngineError::backend(format!("redis: {e}"))
}

/// Convert a payload (de)serialization failure.
pub(crate) fn codec(e: serde_json::Error) -> EngineError {
    EngineError::backend(format!("payload codec: {e}"))
}
