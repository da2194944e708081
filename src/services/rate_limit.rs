use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::rate_limit::{RateLimitDecision, RateLimitSnapshot};
use crate::models::tier::{Tier, TierLimits};

const KEY_PREFIX: &str = "paleon:ratelimit";

/// Atomically admits at most `ceiling` increments per key.
const INCREMENT_WITH_CEILING: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return {0, current}
end
current = redis.call('INCR', KEYS[1])
redis.call('EXPIREAT', KEYS[1], ARGV[2])
return {1, current}
"#;

const DECREMENT_TO_ZERO: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Counter backend for daily rate-limit buckets.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` unless it already reached `ceiling`.
    ///
    /// Returns whether the increment was admitted and the resulting count.
    /// Test and increment happen as one atomic step.
    async fn increment_with_ceiling(
        &self,
        key: &str,
        ceiling: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(bool, u32), RateLimitError>;

    /// Give back one slot; never goes below zero.
    async fn decrement(&self, key: &str) -> Result<(), RateLimitError>;

    async fn clear(&self, key: &str) -> Result<(), RateLimitError>;
}

/// Redis counters driven by Lua scripts so concurrent API replicas agree.
pub struct RedisCounterStore {
    client: redis::Client,
    increment: redis::Script,
    decrement: redis::Script,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            increment: redis::Script::new(INCREMENT_WITH_CEILING),
            decrement: redis::Script::new(DECREMENT_TO_ZERO),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_with_ceiling(
        &self,
        key: &str,
        ceiling: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(bool, u32), RateLimitError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (admitted, current): (i64, i64) = self
            .increment
            .key(key)
            .arg(ceiling)
            .arg(expires_at.timestamp())
            .invoke_async(&mut conn)
            .await?;
        Ok((admitted == 1, u32::try_from(current).unwrap_or(u32::MAX)))
    }

    async fn decrement(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _remaining: i64 = self.decrement.key(key).invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process counters for tests and single-replica deployments.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<u32> {
        self.counters.lock().await.get(key).map(|(count, _)| *count)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_with_ceiling(
        &self,
        key: &str,
        ceiling: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(bool, u32), RateLimitError> {
        let mut counters = self.counters.lock().await;
        // Buckets expiring before this one belong to earlier days.
        counters.retain(|_, (_, expiry)| *expiry >= expires_at);

        let entry = counters.entry(key.to_string()).or_insert((0, expires_at));
        if entry.0 >= ceiling {
            return Ok((false, entry.0));
        }
        entry.0 += 1;
        entry.1 = expires_at;
        Ok((true, entry.0))
    }

    async fn decrement(&self, key: &str) -> Result<(), RateLimitError> {
        if let Some((count, _)) = self.counters.lock().await.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        self.counters.lock().await.remove(key);
        Ok(())
    }
}

/// Per-user, per-tier daily rate limiter with UTC-midnight resets.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: TierLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: TierLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> TierLimits {
        self.limits
    }

    pub async fn check_and_increment(
        &self,
        user_id: &str,
        tier: Tier,
    ) -> Result<RateLimitDecision, RateLimitError> {
        self.check_and_increment_at(user_id, tier, Utc::now()).await
    }

    /// Consume one slot from the caller's bucket for the day containing `now`.
    ///
    /// A denial is a normal outcome carrying the snapshot, not an error.
    pub async fn check_and_increment_at(
        &self,
        user_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let limit = self.limits.limit_for(tier);
        let reset_at = next_reset(now);
        let day = now.date_naive();
        let key = bucket_key(user_id, day);

        let (allowed, current) = self
            .store
            .increment_with_ceiling(&key, limit, reset_at)
            .await?;

        if !allowed {
            tracing::info!(
                user_id = %user_id,
                tier = %tier,
                limit = limit,
                current = current,
                "Rate limit exceeded"
            );
        }

        Ok(RateLimitDecision {
            allowed,
            snapshot: RateLimitSnapshot {
                limit,
                current,
                remaining: limit.saturating_sub(current),
                reset_at,
            },
            day,
        })
    }

    /// Return a slot consumed by a submission that failed after admission.
    ///
    /// `day` is the admission's bucket day, which may already be in the past.
    pub async fn refund(&self, user_id: &str, day: NaiveDate) -> Result<(), RateLimitError> {
        self.store.decrement(&bucket_key(user_id, day)).await
    }

    /// Administrative override: clear today's bucket for `user_id`.
    pub async fn reset(&self, user_id: &str) -> Result<(), RateLimitError> {
        self.reset_day(user_id, Utc::now().date_naive()).await
    }

    pub async fn reset_day(&self, user_id: &str, day: NaiveDate) -> Result<(), RateLimitError> {
        tracing::info!(user_id = %user_id, day = %day, "Resetting rate limit counter");
        self.store.clear(&bucket_key(user_id, day)).await
    }
}

pub fn bucket_key(user_id: &str, day: NaiveDate) -> String {
    format!("{KEY_PREFIX}:{user_id}:{}", day.format("%Y-%m-%d"))
}

/// The next UTC midnight strictly after `now`.
pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    today
        .succ_opt()
        .unwrap_or(today)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit store error: {0}")]
    Redis(#[from] redis::RedisError),
}
