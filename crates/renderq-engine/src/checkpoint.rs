//! Checkpoint store: sequenced, resumable progress markers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use renderq_models::{Checkpoint, TaskId};

use crate::error::{EngineError, EngineResult};

/// Stores the most recent durable checkpoint per task.
///
/// Writes with a sequence number not strictly greater than the stored one
/// are rejected with `StaleCheckpoint`, so an out-of-order update from a
/// retried or duplicate worker can never clobber a newer marker.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save a checkpoint. Fails with `StaleCheckpoint` if `seq` does not
    /// advance the stored sequence.
    async fn save(&self, task: &TaskId, seq: u64, payload: Vec<u8>) -> EngineResult<()>;

    /// Last durable checkpoint for a task, if any.
    async fn load(&self, task: &TaskId) -> EngineResult<Option<Checkpoint>>;

    /// Drop the checkpoint (terminal transition cleanup).
    async fn clear(&self, task: &TaskId) -> EngineResult<()>;
}

/// In-process checkpoint backend.
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<TaskId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, task: &TaskId, seq: u64, payload: Vec<u8>) -> EngineResult<()> {
        let mut checkpoints = self.checkpoints.write().await;

        if let Some(stored) = checkpoints.get(task) {
            if seq <= stored.seq {
                return Err(EngineError::StaleCheckpoint {
                    task: task.clone(),
                    stored: stored.seq,
                    got: seq,
                });
            }
        }

        checkpoints.insert(task.clone(), Checkpoint::new(seq, payload));
        debug!(task_id = %task, seq, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, task: &TaskId) -> EngineResult<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(task).cloned())
    }

    async fn clear(&self, task: &TaskId) -> EngineResult<()> {
        self.checkpoints.write().await.remove(task);
        Ok(())
    }
}
