use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Status of a classification job in the async queue.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Position along pending -> processing -> terminal. Observed ranks never decrease.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed edges of the job lifecycle.
    ///
    /// `Pending -> Failed` is only taken when a submission could not be
    /// enqueued; every other failure passes through `Processing`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// An uploaded image as received at submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageInput {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// A fossil classification job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub request_id: String,
    pub status: JobStatus,
    pub image_count: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// When the most recent queue message for this job was sent.
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move job from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    pub fn new(user_id: impl Into<String>, request_id: impl Into<String>, image_count: i32) -> Self {
        let now = store_timestamp(Utc::now());
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            request_id: request_id.into(),
            status: JobStatus::Pending,
            image_count,
            result: None,
            error: None,
            processing_time_ms: None,
            created_at: now,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Claim the job for processing.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record a successful classification. Status and result change together.
    pub fn complete(
        &mut self,
        result: serde_json::Value,
        processing_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.processing_time_ms = Some(processing_time_ms);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record a terminal failure. Status and error change together.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        processing_time_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.result = None;
        self.error = Some(error.into());
        self.processing_time_ms = processing_time_ms;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// Truncate to the microsecond precision Postgres keeps, so a timestamp
/// read back from the store compares equal to the one written.
pub fn store_timestamp(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}
