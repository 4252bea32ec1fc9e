//! Worker error types.

use thiserror::Error;

use renderq_engine::EngineError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Initialization failed: {0}")]
    Init(String),
}

impl WorkerError {
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }
}
