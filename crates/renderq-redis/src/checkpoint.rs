//! Distributed checkpoint store on Redis hashes.
//!
//! One hash per task with `seq` and `payload` fields. The sequence guard
//! runs in Lua so concurrent writers from a retried or duplicate worker
//! resolve atomically server-side.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use renderq_engine::{CheckpointStore, EngineError, EngineResult};
use renderq_models::{Checkpoint, TaskId};

use crate::config::RedisConfig;
use crate::error::backend;

// Store only if the new seq strictly advances; returns the stored seq on
// rejection, -1 on success.
const SAVE_GUARDED: &str = r#"
local stored = redis.call('HGET', KEYS[1], 'seq')
if stored and tonumber(stored) >= tonumber(ARGV[1]) then
    return tonumber(stored)
end
redis.call('HSET', KEYS[1], 'seq', ARGV[1], 'payload', ARGV[2])
return -1
"#;

/// Redis-backed checkpoint store.
pub struct RedisCheckpointStore {
    client: redis::Client,
    prefix: String,
    save_script: redis::Script,
}

impl RedisCheckpointStore {
    pub fn new(config: &RedisConfig) -> EngineResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(backend)?;
        Ok(Self {
            client,
            prefix: config.key("checkpoint"),
            save_script: redis::Script::new(SAVE_GUARDED),
        })
    }

    fn key(&self, task: &TaskId) -> String {
        format!("{}:{}", self.prefix, task)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, task: &TaskId, seq: u64, payload: Vec<u8>) -> EngineResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let result: i64 = self
            .save_script
            .key(self.key(task))
            .arg(seq)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if result >= 0 {
            return Err(EngineError::StaleCheckpoint {
                task: task.clone(),
                stored: result as u64,
                got: seq,
            });
        }
        debug!(task_id = %task, seq, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, task: &TaskId) -> EngineResult<Option<Checkpoint>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        let fields: Option<(u64, Vec<u8>)> = {
            let seq: Option<u64> = conn
                .hget(self.key(task), "seq")
                .await
                .map_err(backend)?;
            match seq {
                Some(seq) => {
                    let payload: Vec<u8> = conn
                        .hget(self.key(task), "payload")
                        .await
                        .map_err(backend)?;
                    Some((seq, payload))
                }
                None => None,
            }
        };
        Ok(fields.map(|(seq, payload)| Checkpoint::new(seq, payload)))
    }

    async fn clear(&self, task: &TaskId) -> EngineResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        conn.del::<_, ()>(self.key(task)).await.map_err(backend)?;
        Ok(())
    }
}
