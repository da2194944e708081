use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::Job;

const QUEUE_KEY: &str = "paleon:jobs";
const PROCESSING_KEY_PREFIX: &str = "paleon:processing";

/// Job payload serialized into the queue. Image bytes stay in the job store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub request_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(job_id: Uuid, request_id: impl Into<String>) -> Self {
        Self {
            job_id,
            request_id: request_id.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Message for `job`, stamped with the job's recorded enqueue time.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            request_id: job.request_id.clone(),
            enqueued_at: job.enqueued_at,
        }
    }
}

/// A dequeued message. `payload` is the raw form needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    pub payload: String,
}

/// Task queue connecting the submission endpoint to worker processes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Take the oldest message, parking it in `consumer`'s processing list.
    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    /// Drop a delivery from `consumer`'s processing list.
    async fn ack(&self, consumer: &str, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return messages left in `consumer`'s processing list to the front of the queue.
    async fn recover(&self, consumer: &str) -> Result<usize, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    /// `enqueued_at` of the next message to be delivered, if any.
    ///
    /// Delivery is FIFO, so a job whose last message was sent before this
    /// instant has nothing left waiting in the queue.
    async fn oldest_enqueued_at(&self) -> Result<Option<DateTime<Utc>>, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

fn processing_key(consumer: &str) -> String {
    format!("{PROCESSING_KEY_PREFIX}:{consumer}")
}

/// Redis-backed reliable queue (list + per-consumer processing list).
pub struct RedisJobQueue {
    client: redis::Client,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, processing_key(consumer))
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let job: QueuedJob =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(Delivery { job, payload }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, consumer: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(processing_key(consumer), 1, &delivery.payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let key = processing_key(consumer);
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn
                .lmove(
                    &key,
                    QUEUE_KEY,
                    redis::Direction::Left,
                    redis::Direction::Right,
                )
                .await
                .map_err(QueueError::Redis)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn oldest_enqueued_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut conn = self.connection().await?;
        // Messages are pushed on the left and popped from the right.
        let head: Option<String> = conn.lindex(QUEUE_KEY, -1).await.map_err(QueueError::Redis)?;
        match head {
            Some(payload) => {
                let job: QueuedJob =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(job.enqueued_at))
            }
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    // Front is the oldest message, mirroring the Redis tail.
    ready: VecDeque<String>,
    processing: HashMap<String, Vec<String>>,
}

/// In-process queue with the same delivery semantics as [`RedisJobQueue`].
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn in_flight(&self, consumer: &str) -> usize {
        self.state
            .lock()
            .await
            .processing
            .get(consumer)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        self.state.lock().await.ready.push_back(payload);
        Ok(())
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };
        state
            .processing
            .entry(consumer.to_string())
            .or_default()
            .push(payload.clone());
        let job = serde_json::from_str(&payload)?;
        Ok(Some(Delivery { job, payload }))
    }

    async fn ack(&self, consumer: &str, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(list) = state.processing.get_mut(consumer) {
            if let Some(pos) = list.iter().position(|p| *p == delivery.payload) {
                list.remove(pos);
            }
        }
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let leftovers = state.processing.remove(consumer).unwrap_or_default();
        let count = leftovers.len();
        for payload in leftovers.into_iter().rev() {
            state.ready.push_front(payload);
        }
        Ok(count)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.ready.len() as u64)
    }

    async fn oldest_enqueued_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let state = self.state.lock().await;
        match state.ready.front() {
            Some(payload) => Ok(Some(serde_json::from_str::<QueuedJob>(payload)?.enqueued_at)),
            None => Ok(None),
        }
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
