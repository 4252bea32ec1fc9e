//! Distributed leases on Redis string keys with PX expiry.
//!
//! Acquisition is `SET NX PX`; renewal and release are owner-compared Lua
//! scripts so a worker whose lease already expired (and was possibly
//! re-granted) can never touch the new holder's lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::debug;

use renderq_engine::{EngineError, EngineResult, LeaseStore};
use renderq_models::{Lease, TaskId, WorkerId};

use crate::config::RedisConfig;
use crate::error::backend;

// Extend the ttl only if the caller still owns the key.
const RENEW: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

// Delete only if the caller owns the key.
const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// Redis-backed lease store.
pub struct RedisLeaseStore {
    client: redis::Client,
    prefix: String,
    renew_script: redis::Script,
    release_script: redis::Script,
}

impl RedisLeaseStore {
    pub fn new(config: &RedisConfig) -> EngineResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(backend)?;
        Ok(Self {
            client,
            prefix: config.key("lease"),
            renew_script: redis::Script::new(RENEW),
            release_script: redis::Script::new(RELEASE),
        })
    }

    fn key(&self, task: &TaskId) -> String {
        format!("{}:{}", self.prefix, task)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        ttl: Duration,
    ) -> EngineResult<DateTime<Utc>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let taken: Option<String> = redis::cmd("SET")
            .arg(self.key(task))
            .arg(worker.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        if taken.is_none() {
            return Err(EngineError::AlreadyLeased { task: task.clone() });
        }
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        debug!(task_id = %task, worker_id = %worker, %expires_at, "Lease acquired");
        Ok(expires_at)
    }

    async fn renew(
        &self,
        task: &TaskId,
        worker: &WorkerId,
        ttl: Duration,
    ) -> EngineResult<DateTime<Utc>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let renewed: i64 = self
            .renew_script
            .key(self.key(task))
            .arg(worker.as_str())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if renewed == 0 {
            return Err(EngineError::LeaseLost { task: task.clone() });
        }
        Ok(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
    }

    async fn release(&self, task: &TaskId, worker: &WorkerId) -> EngineResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let _: i64 = self
            .release_script
            .key(self.key(task))
            .arg(worker.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, task: &TaskId) -> EngineResult<Option<Lease>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let owner: Option<String> = conn.get(self.key(task)).await.map_err(backend)?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        let ttl_ms: i64 = conn.pttl(self.key(task)).await.map_err(backend)?;
        if ttl_ms < 0 {
            // Key vanished between the two reads
            return Ok(None);
        }
        let expires_at = Utc::now() + chrono::Duration::milliseconds(ttl_ms);
        Ok(Some(Lease::new(WorkerId::from_string(owner), expires_at)))
    }
}
