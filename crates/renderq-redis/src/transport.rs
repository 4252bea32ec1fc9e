//! Event transport over Redis Pub/Sub.
//!
//! Each task gets its own channel; subscribers on other processes receive
//! the engine's event envelopes as JSON. Pub/Sub is fire-and-forget, so
//! the engine's terminal-event redelivery loop treats a publish error as
//! an unacknowledged delivery and retries.

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;

use renderq_engine::{EngineResult, EventSink};
use renderq_models::{TaskEvent, TaskId};

use crate::config::RedisConfig;
use crate::error::{backend, codec};

/// Publishes and subscribes to task event channels.
pub struct RedisEventChannel {
    client: redis::Client,
    prefix: String,
    sink_id: String,
}

impl RedisEventChannel {
    pub fn new(config: &RedisConfig) -> EngineResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(backend)?;
        Ok(Self {
            client,
            prefix: config.key("events"),
            sink_id: format!("redis-events:{}", config.key_prefix),
        })
    }

    fn channel_name(&self, task: &TaskId) -> String {
        format!("{}:{}", self.prefix, task)
    }

    /// Subscribe to a task's event channel.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        task: &TaskId,
    ) -> EngineResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = TaskEvent> + Send>>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        let channel = self.channel_name(task);
        pubsub.subscribe(&channel).await.map_err(backend)?;
        debug!(task_id = %task, channel, "Subscribed to event channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl EventSink for RedisEventChannel {
    fn id(&self) -> &str {
        &self.sink_id
    }

    async fn deliver(&self, event: &TaskEvent) -> EngineResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let channel = self.channel_name(&event.task_id);
        let payload = serde_json::to_string(event).map_err(codec)?;

        redis::AsyncCommands::publish::<_, _, ()>(&mut conn, channel, payload)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
