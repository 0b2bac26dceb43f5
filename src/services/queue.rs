use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::job::{Dimensions, Filter};

const DELAYED_KEY: &str = "image_pipeline:delayed";
const QUEUE_KEY: &str = "image_pipeline:tasks";
const PROCESSING_KEY: &str = "image_pipeline:processing";

/// Promote due delayed tasks to the ready list, then move one ready task into
/// the processing list. Runs atomically on the Redis server.
const DEQUEUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, payload in ipairs(due) do
    redis.call('ZREM', KEYS[1], payload)
    redis.call('LPUSH', KEYS[2], payload)
end
return redis.call('RPOPLPUSH', KEYS[2], KEYS[3])
"#;

/// Task payload serialized onto the queue.
///
/// A resize is requested iff both `width` and `height` are present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedTask {
    pub image_id: String,
    pub filter: Option<Filter>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl QueuedTask {
    pub fn new(image_id: impl Into<String>, filter: Option<Filter>, resize: Option<Dimensions>) -> Self {
        Self {
            image_id: image_id.into(),
            filter,
            width: resize.map(|d| d.width),
            height: resize.map(|d| d.height),
        }
    }

    pub fn resize(&self) -> Option<Dimensions> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Dimensions::new(width, height)),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// At-least-once delivery channel from admission to workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task that becomes deliverable after `delay`.
    async fn enqueue(&self, task: &QueuedTask, delay: Duration) -> Result<(), QueueError>;

    /// Take the next deliverable task, if any. The task stays in flight until
    /// `complete` is called.
    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError>;

    /// Acknowledge a delivered task.
    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Return unacknowledged in-flight tasks to the ready queue.
    async fn requeue_in_flight(&self) -> Result<u64, QueueError>;

    /// Tasks waiting for delivery, delayed or ready.
    async fn queue_depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed task queue with delayed delivery.
pub struct RedisTaskQueue {
    client: redis::Client,
    script: redis::Script,
}

impl RedisTaskQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            script: redis::Script::new(DEQUEUE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &QueuedTask, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = task.to_payload()?;
        let eligible_at = now_millis() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, &payload, eligible_at)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = self
            .script
            .key(DELAYED_KEY)
            .key(QUEUE_KEY)
            .key(PROCESSING_KEY)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;

        match result {
            Some(payload) => match QueuedTask::from_payload(&payload) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    // Drop it so the worker does not spin on it.
                    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
                    tracing::error!(payload = %payload, error = %e, "Discarding malformed task");
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = task.to_payload()?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await?;
        Ok(())
    }

    async fn requeue_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let mut moved = 0;
        loop {
            let payload: Option<String> = conn.rpoplpush(PROCESSING_KEY, QUEUE_KEY).await?;
            match payload {
                Some(_) => moved += 1,
                None => break,
            }
        }
        Ok(moved)
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let ready: u64 = conn.llen(QUEUE_KEY).await?;
        let delayed: u64 = conn.zcard(DELAYED_KEY).await?;
        Ok(ready + delayed)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process task queue with the same delay and acknowledgement semantics.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<MemoryQueueState>,
}

#[derive(Default)]
struct MemoryQueueState {
    delayed: Vec<(Instant, QueuedTask)>,
    ready: VecDeque<QueuedTask>,
    in_flight: Vec<QueuedTask>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Vec<QueuedTask> {
        self.lock().in_flight.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &QueuedTask, delay: Duration) -> Result<(), QueueError> {
        self.lock().delayed.push((Instant::now() + delay, task.clone()));
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let mut state = self.lock();
        let now = Instant::now();

        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.delayed = pending;
        due.sort_by_key(|(at, _)| *at);
        state.ready.extend(due.into_iter().map(|(_, task)| task));

        let next = state.ready.pop_front();
        if let Some(task) = &next {
            state.in_flight.push(task.clone());
        }
        Ok(next)
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut state = self.lock();
        if let Some(pos) = state.in_flight.iter().position(|t| t == task) {
            state.in_flight.remove(pos);
        }
        Ok(())
    }

    async fn requeue_in_flight(&self) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let in_flight = std::mem::take(&mut state.in_flight);
        let moved = in_flight.len() as u64;
        state.ready.extend(in_flight);
        Ok(moved)
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let state = self.lock();
        Ok((state.delayed.len() + state.ready.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
