use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::rate_limit::RateLimitSnapshot;

/// Response after submitting images for classification.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClassifyAsyncResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub request_id: String,
    pub rate_limit: RateLimitSnapshot,
}

/// Response for polling a single job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResultResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub image_count: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
}

impl From<Job> for JobResultResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            image_count: job.image_count,
            created_at: job.created_at,
            completed_at: job.completed_at,
            result: job.result,
            error: job.error,
            processing_time_ms: job.processing_time_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResultResponse>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitResetResponse {
    pub user_id: String,
    pub reset: bool,
}
