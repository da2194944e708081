use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{ImageInput, InvalidTransition, Job, JobStatus};

/// Repository for job records and their uploaded inputs.
///
/// Every status change is conditional on the current status, so concurrent
/// writers cannot move a job backwards, and status is always written together
/// with its result or error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a pending job and its inputs in one atomic write.
    async fn create(&self, job: &Job, inputs: &[ImageInput]) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Most recent first.
    async fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, StoreError>;

    /// Move a pending job to processing. Returns `false` if it was not pending.
    async fn claim(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
        processing_time_ms: i64,
    ) -> Result<(), StoreError>;

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        processing_time_ms: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn load_inputs(&self, id: Uuid) -> Result<Vec<ImageInput>, StoreError>;

    async fn delete_inputs(&self, id: Uuid) -> Result<(), StoreError>;

    /// Pending jobs last enqueued before `enqueued_before`, oldest first.
    ///
    /// Their `enqueued_at` is set to `now` in the same step, so each job is
    /// handed to at most one caller per staleness window.
    async fn take_stale_pending(
        &self,
        enqueued_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Fail processing jobs started before `started_before`; returns their ids.
    async fn fail_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id}: {source}")]
    Transition {
        id: Uuid,
        #[source]
        source: InvalidTransition,
    },

    #[error("Unrecognised job status in store: {0}")]
    UnknownStatus(String),
}

struct StoredJob {
    job: Job,
    inputs: Vec<ImageInput>,
}

/// In-memory job store. Readers never observe a half-applied update because
/// each mutation happens under the write lock.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, StoredJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs that still hold their uploaded inputs.
    pub async fn inputs_retained(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|stored| !stored.inputs.is_empty())
            .count()
    }

    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), InvalidTransition> + Send,
    {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(&mut stored.job).map_err(|source| StoreError::Transition { id, source })
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job, inputs: &[ImageInput]) -> Result<(), StoreError> {
        self.jobs.write().await.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                inputs: inputs.to_vec(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).map(|s| s.job.clone()))
    }

    async fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<Job> = jobs
            .values()
            .filter(|s| s.job.is_owned_by(user_id))
            .map(|s| s.job.clone())
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit as usize);
        Ok(owned)
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if stored.job.status != JobStatus::Pending {
            return Ok(false);
        }
        stored
            .job
            .start(Utc::now())
            .map_err(|source| StoreError::Transition { id, source })?;
        Ok(true)
    }

    async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
        processing_time_ms: i64,
    ) -> Result<(), StoreError> {
        self.mutate(id, |job| job.complete(result, processing_time_ms, Utc::now()))
            .await
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        processing_time_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        let error = error.to_string();
        self.mutate(id, |job| job.fail(error, processing_time_ms, Utc::now()))
            .await
    }

    async fn load_inputs(&self, id: Uuid) -> Result<Vec<ImageInput>, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|s| s.inputs.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete_inputs(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(stored) = self.jobs.write().await.get_mut(&id) {
            stored.inputs.clear();
        }
        Ok(())
    }

    async fn take_stale_pending(
        &self,
        enqueued_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut stale: Vec<&mut Job> = jobs
            .values_mut()
            .map(|s| &mut s.job)
            .filter(|j| j.status == JobStatus::Pending && j.enqueued_at < enqueued_before)
            .collect();
        stale.sort_by_key(|j| j.enqueued_at);
        Ok(stale
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|j| {
                j.enqueued_at = now;
                j.clone()
            })
            .collect())
    }

    async fn fail_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut expired = Vec::new();
        for stored in jobs.values_mut() {
            let started = stored.job.started_at.unwrap_or(stored.job.created_at);
            if stored.job.status == JobStatus::Processing && started < started_before {
                let id = stored.job.id;
                stored
                    .job
                    .fail(error, None, now)
                    .map_err(|source| StoreError::Transition { id, source })?;
                stored.inputs.clear();
                expired.push(id);
            }
        }
        Ok(expired)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
