//! Lease management: time-bounded exclusive task ownership.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use renderq_models::{Lease, TaskId, WorkerId};

use crate::error::{EngineError, EngineResult};

/// Grants a worker exclusive ownership of a task for a bounded duration.
///
/// Expiry is passive: an expired lease is treated as if it never existed,
/// and every worker-originated update re-verifies freshness through
/// [`LeaseStore::get`] rather than trusting a cached flag.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire a lease. Fails with `AlreadyLeased` if a live lease exists.
    async fn acquire(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        ttl: Duration,
    ) -> EngineResult<DateTime<Utc>>;

    /// Extend the lease. Fails with `LeaseLost` unless `worker` is the
    /// current live holder.
    async fn renew(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        ttl: Duration,
    ) -> EngineResult<DateTime<Utc>>;

    /// Release the lease. Idempotent: releasing a lease not held by
    /// `worker` is a no-op.
    async fn release(&self, task: &TaskId, worker: &WorkerId) -> EngineResult<()>;

    /// Current lease for a task, if any (may be expired; callers check).
    async fn get(&self, task: &TaskId) -> EngineResult<Option<Lease>>;
}

/// In-process lease backend.
pub struct MemoryLeaseStore {
    leases: RwLock<HashMap<TaskId, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expires(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        ttl: Duration,
    ) -> EngineResult<DateTime<Utc>> {
        let mut leases = self.leases.write().await;
        let now = Utc::now();

        if let Some(existing) = leases.get(task) {
            if existing.is_live(now) {
                return Err(EngineError::AlreadyLeased { task: task.clone() });
            }
        }

        let expires_at = expires(ttl);
        leases.insert(task.clone(), Lease::new(worker.clone(), expires_at));
        debug!(task_id = %task, worker_id = %worker, %expires_at, "Lease acquired");
        Ok(expires_at)
    }

    async fn renew(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        ttl: Duration,
    ) -> EngineResult<DateTime<Utc>> {
        let mut leases = self.leases.write().await;
        let now = Utc::now();

        match leases.get_mut(task) {
            Some(lease) if lease.is_held_by(worker, now) => {
                lease.expires_at = expires(ttl);
                Ok(lease.expires_at)
            }
            _ => Err(EngineError::LeaseLost { task: task.clone() }),
        }
    }

    async fn release(&self, task: &TaskId, worker: &WorkerId) -> EngineResult<()> {
        let mut leases = self.leases.write().await;
        if leases.get(task).map(|l| &l.owner) == Some(worker) {
            leases.remove(task);
            debug!(task_id = %task, worker_id = %worker, "Lease released");
        }
        Ok(())
    }

    async fn get(&self, task: &TaskId) -> EngineResult<Option<Lease>> {
        Ok(self.leases.read().await.get(task).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (TaskId, WorkerId, WorkerId) {
        (
            TaskId::from_string("t1"),
            WorkerId::from_string("w1"),
            WorkerId::from_string("w2"),
        )
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = MemoryLeaseStore::new();
        let (task, w1, w2) = ids();
        let ttl = Duration::from_secs(60);

        store.acquire(&task, &w1, ttl).await.unwrap();
        let err = store.acquire(&task, &w2, ttl).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyLeased { .. }));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reacquirable() {
        let store = MemoryLeaseStore::new();
        let (task, w1, w2) = ids();

        store.acquire(&task, &w1, Duration::ZERO).await.unwrap();
        // w1's lease already expired; w2 may take over
        store.acquire(&task, &w2, Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_requires_live_holder() {
        let store = MemoryLeaseStore::new();
        let (task, w1, w2) = ids();
        let ttl = Duration::from_secs(60);

        let first = store.acquire(&task, &w1, ttl).await.unwrap();
        let renewed = store.renew(&task, &w1, ttl).await.unwrap();
        assert!(renewed >= first);

        let err = store.renew(&task, &w2, ttl).await.unwrap_err();
        assert!(matches!(err, EngineError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_renew_fails_after_expiry() {
        let store = MemoryLeaseStore::new();
        let (task, w1, _) = ids();

        store.acquire(&task, &w1, Duration::ZERO).await.unwrap();
        let err = store.renew(&task, &w1, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, EngineError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryLeaseStore::new();
        let (task, w1, w2) = ids();
        let ttl = Duration::from_secs(60);

        store.acquire(&task, &w1, ttl).await.unwrap();
        store.release(&task, &w1).await.unwrap();
        store.release(&task, &w1).await.unwrap();
        assert!(store.get(&task).await.unwrap().is_none());

        // Releasing someone else's lease is a no-op
        store.acquire(&task, &w2, ttl).await.unwrap();
        store.release(&task, &w1).await.unwrap();
        assert!(store.get(&task).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let store = std::sync::Arc::new(MemoryLeaseStore::new());
        let task = TaskId::from_string("t1");
        let ttl = Duration::from_secs(60);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = std::sync::Arc::clone(&store);
            let task = task.clone();
            let worker = WorkerId::from_string(format!("w{i}"));
            handles.push(tokio::spawn(async move {
                store.acquire(&task, &worker, ttl).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
