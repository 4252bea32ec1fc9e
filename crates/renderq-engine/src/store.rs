//! Record Store collaborator seam.
//!
//! The orchestrator's in-memory records are authoritative; terminal
//! snapshots are handed to the external Record Store for long-term audit
//! history. Retention and deletion are the collaborator's concern.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use renderq_models::{TaskId, TaskRecord};

use crate::error::EngineResult;

/// Durable audit store for task record snapshots.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a snapshot (upsert by task id).
    async fn save(&self, record: &TaskRecord) -> EngineResult<()>;

    /// Fetch a previously saved snapshot.
    async fn load(&self, task: &TaskId) -> EngineResult<Option<TaskRecord>>;
}

/// In-process record store, for tests and single-node deployments.
pub struct MemoryRecordStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &TaskRecord) -> EngineResult<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, task: &TaskId) -> EngineResult<Option<TaskRecord>> {
        Ok(self.records.read().await.get(task).cloned())
    }
}
