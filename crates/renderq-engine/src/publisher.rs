//! Event fan-out to subscribers with batching and de-duplication support.
//!
//! Delivery is at-least-once; subscribers de-duplicate on
//! `(task_id, kind, seq)`. Progress events are rate-limited per task:
//! within the configured window only the latest value is kept, intermediate
//! values are dropped, not queued. Terminal events are never dropped and
//! are redelivered with backoff until the sink acknowledges or the
//! subscriber unsubscribes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use renderq_models::{TaskEvent, TaskEventKind, TaskId};

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// Delivery handle provided by the Transport collaborator.
///
/// `deliver` returning `Ok` is the delivery acknowledgement.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Stable identity, used to unsubscribe.
    fn id(&self) -> &str;

    /// Push one event to the sink.
    async fn deliver(&self, event: &TaskEvent) -> EngineResult<()>;
}

struct Subscriber {
    sink: Arc<dyn EventSink>,
    // Flipped on unsubscribe; stops in-flight terminal redelivery loops.
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct TaskChannel {
    seq: u64,
    subscribers: Vec<Subscriber>,
    last_progress: Option<Instant>,
    pending_progress: Option<TaskEventKind>,
    flush_scheduled: bool,
    terminal: bool,
    // Terminal delivery finished; the entry only survives for reopen.
    torn_down: bool,
    // The task can never reopen; drop the entry once torn down.
    retired: bool,
}

struct Inner {
    channels: Mutex<HashMap<TaskId, TaskChannel>>,
    progress_interval: Duration,
    retry_delay: Duration,
    retry_cap: Duration,
}

/// Fans lifecycle and progress events out to per-task subscribers.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                progress_interval: config.progress_interval,
                retry_delay: config.event_retry_delay,
                retry_cap: config.event_retry_cap,
            }),
        }
    }

    /// Register a sink for a task's events.
    pub async fn subscribe(&self, task: &TaskId, sink: Arc<dyn EventSink>) {
        let mut channels = self.inner.channels.lock().await;
        let channel = channels.entry(task.clone()).or_default();
        debug!(task_id = %task, sink_id = sink.id(), "Subscriber added");
        channel.subscribers.push(Subscriber {
            sink,
            active: Arc::new(AtomicBool::new(true)),
        });
    }

    /// Remove a sink; any in-flight redelivery loop for it stops.
    pub async fn unsubscribe(&self, task: &TaskId, sink_id: &str) {
        let mut channels = self.inner.channels.lock().await;
        if let Some(channel) = channels.get_mut(task) {
            channel.subscribers.retain(|s| {
                if s.sink.id() == sink_id {
                    s.active.store(false, Ordering::SeqCst);
                    false
                } else {
                    true
                }
            });
            // Rate-limiter state is torn down with the last subscriber
            if channel.subscribers.is_empty() {
                channel.pending_progress = None;
            }
        }
    }

    /// Number of active subscribers for a task.
    pub async fn subscriber_count(&self, task: &TaskId) -> usize {
        self.inner
            .channels
            .lock()
            .await
            .get(task)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Publish an event to all subscribers of `task`.
    ///
    /// Returns the sequence number assigned to the event, or `None` if it
    /// was coalesced into the pending rate-limiter slot.
    pub async fn publish(&self, task: &TaskId, kind: TaskEventKind) -> Option<u64> {
        let mut channels = self.inner.channels.lock().await;
        let channel = channels.entry(task.clone()).or_default();

        if channel.terminal {
            // Nothing follows a terminal event
            return None;
        }

        if kind.is_terminal() {
            channel.terminal = true;
            channel.pending_progress = None;
            channel.seq += 1;
            let event = TaskEvent::new(task.clone(), channel.seq, kind);
            let targets = snapshot(channel);
            let seq = channel.seq;
            drop(channels);

            self.deliver_terminal(task.clone(), event, targets);
            return Some(seq);
        }

        if kind.is_progress() {
            let now = Instant::now();
            if let Some(last) = channel.last_progress {
                if now.duration_since(last) < self.inner.progress_interval {
                    // Keep only the latest value; arm one flush timer per task
                    channel.pending_progress = Some(kind);
                    if !channel.flush_scheduled {
                        channel.flush_scheduled = true;
                        let fire_at = last + self.inner.progress_interval;
                        let publisher = self.clone();
                        let task = task.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep_until(fire_at).await;
                            publisher.flush_pending(&task).await;
                        });
                    }
                    return None;
                }
            }

            channel.last_progress = Some(now);
            channel.pending_progress = None;
        }

        channel.seq += 1;
        let event = TaskEvent::new(task.clone(), channel.seq, kind);
        let targets = snapshot(channel);
        let seq = channel.seq;
        drop(channels);

        deliver_best_effort(event, targets);
        Some(seq)
    }

    /// Emit the coalesced pending progress value, if any.
    async fn flush_pending(&self, task: &TaskId) {
        let mut channels = self.inner.channels.lock().await;
        let Some(channel) = channels.get_mut(task) else {
            return;
        };
        channel.flush_scheduled = false;
        if channel.terminal {
            return;
        }
        let Some(kind) = channel.pending_progress.take() else {
            return;
        };

        channel.last_progress = Some(Instant::now());
        channel.seq += 1;
        let event = TaskEvent::new(task.clone(), channel.seq, kind);
        let targets = snapshot(channel);
        drop(channels);

        deliver_best_effort(event, targets);
    }

    /// Deliver a terminal event with retry-until-ack per subscriber, then
    /// tear the channel down.
    fn deliver_terminal(
        &self,
        task: TaskId,
        event: TaskEvent,
        targets: Vec<(Arc<dyn EventSink>, Arc<AtomicBool>)>,
    ) {
        let mut handles = Vec::with_capacity(targets.len());
        for (sink, active) in targets {
            let event = event.clone();
            let base = self.inner.retry_delay;
            let cap = self.inner.retry_cap;
            handles.push(tokio::spawn(async move {
                let mut attempt = 0u32;
                while active.load(Ordering::SeqCst) {
                    match sink.deliver(&event).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(
                                task_id = %event.task_id,
                                sink_id = sink.id(),
                                attempt,
                                "Terminal event delivery failed, will retry: {}", e
                            );
                            let delay = base.saturating_mul(1u32 << attempt.min(16)).min(cap);
                            attempt = attempt.saturating_add(1);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }));
        }

        let publisher = self.clone();
        tokio::spawn(async move {
            for handle in handles {
                handle.await.ok();
            }
            // Tear down subscribers and timers; the seq counter survives so
            // a reopened task can never reuse a sequence number.
            let mut channels = publisher.inner.channels.lock().await;
            let drop_entry = match channels.get_mut(&task) {
                Some(channel) => {
                    channel.subscribers.clear();
                    channel.pending_progress = None;
                    channel.torn_down = true;
                    channel.retired
                }
                None => false,
            };
            if drop_entry {
                channels.remove(&task);
            }
        });
    }

    /// Reopen a terminal channel for a task re-entering the queue
    /// (operator requeue); the sequence counter continues from where it
    /// left off.
    pub async fn reopen(&self, task: &TaskId) {
        let mut channels = self.inner.channels.lock().await;
        if let Some(channel) = channels.get_mut(task) {
            channel.terminal = false;
            channel.last_progress = None;
            channel.torn_down = false;
            channel.retired = false;
        }
    }

    /// Drop a task's channel state once its terminal delivery settles.
    /// Only for tasks that can never reopen; a retired seq counter is gone
    /// for good.
    pub async fn retire(&self, task: &TaskId) {
        let mut channels = self.inner.channels.lock().await;
        let drop_entry = match channels.get_mut(task) {
            Some(channel) if channel.torn_down => true,
            Some(channel) => {
                channel.retired = true;
                false
            }
            None => false,
        };
        if drop_entry {
            channels.remove(task);
        }
    }
}

fn snapshot(channel: &TaskChannel) -> Vec<(Arc<dyn EventSink>, Arc<AtomicBool>)> {
    channel
        .subscribers
        .iter()
        .map(|s| (Arc::clone(&s.sink), Arc::clone(&s.active)))
        .collect()
}

/// Single-attempt delivery for non-terminal events; failures are logged,
/// never queued.
fn deliver_best_effort(event: TaskEvent, targets: Vec<(Arc<dyn EventSink>, Arc<AtomicBool>)>) {
    for (sink, active) in targets {
        let event = event.clone();
        tokio::spawn(async move {
            if !active.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = sink.deliver(&event).await {
                warn!(
                    task_id = %event.task_id,
                    sink_id = sink.id(),
                    "Event delivery failed: {}", e
                );
            }
        });
    }
}
