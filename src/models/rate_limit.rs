use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Rate-limit state returned to clients on every submission attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub current: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Outcome of a single check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub snapshot: RateLimitSnapshot,
    /// UTC day of the bucket that was checked. Refunds go back to this bucket.
    pub day: NaiveDate,
}
