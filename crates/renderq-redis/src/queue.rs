//! Distributed task queue on a Redis sorted set.
//!
//! Members are task ids scored by their readiness time in epoch
//! milliseconds, so delayed retries and immediate submissions share one
//! structure. Popping is a Lua compare-and-pop, atomic across competing
//! worker processes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::debug;

use renderq_engine::{EngineResult, TaskQueue};
use renderq_models::TaskId;

use crate::config::RedisConfig;
use crate::error::backend;

// Pop the lowest-scored member if its readiness time has passed.
const POP_READY: &str = r#"
local hit = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #hit == 0 then
    return false
end
redis.call('ZREM', KEYS[1], hit[1])
return hit[1]
"#;

/// Redis-backed task queue.
pub struct RedisTaskQueue {
    client: redis::Client,
    key: String,
    pop_script: redis::Script,
    /// How often a blocked pop re-checks for ready members
    poll_interval: Duration,
}

impl RedisTaskQueue {
    pub fn new(config: &RedisConfig) -> EngineResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(backend)?;
        Ok(Self {
            client,
            key: config.key("queue"),
            pop_script: redis::Script::new(POP_READY),
            poll_interval: Duration::from_millis(100),
        })
    }

    async fn try_pop(&self) -> EngineResult<Option<TaskId>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let now_ms = Utc::now().timestamp_millis();
        let hit: Option<String> = self
            .pop_script
            .key(&self.key)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(hit.map(TaskId::from_string))
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, task: TaskId, delay: Duration) -> EngineResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(&self.key, task.as_str(), ready_at)
            .await
            .map_err(backend)?;
        debug!(task_id = %task, delay_ms = delay.as_millis() as u64, "Task enqueued");
        Ok(())
    }

    async fn pop_ready(&self, timeout: Duration) -> EngineResult<Option<TaskId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_pop().await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn remove(&self, task: &TaskId) -> EngineResult<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let removed: u64 = conn
            .zrem(&self.key, task.as_str())
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn len(&self) -> EngineResult<usize> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let len: usize = conn.zcard(&self.key).await.map_err(backend)?;
        Ok(len)
    }
}
