use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::Job;
use crate::services::store::{JobStore, StoreError};

pub const DEFAULT_LIST_LIMIT: u32 = 10;
pub const MAX_LIST_LIMIT: u32 = 100;

/// Read-only access to jobs on behalf of their owners.
pub struct JobService {
    store: Arc<dyn JobStore>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Fetch a job for `requesting_user`. Never mutates anything.
    pub async fn get_result(&self, job_id: Uuid, requesting_user: &str) -> Result<Job, JobError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound)?;

        if !job.is_owned_by(requesting_user) {
            tracing::warn!(
                job_id = %job_id,
                user_id = %requesting_user,
                "Job requested by non-owner"
            );
            return Err(JobError::Forbidden);
        }
        Ok(job)
    }

    pub async fn list(&self, user_id: &str, limit: Option<u32>) -> Result<Vec<Job>, JobError> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_for_user(user_id, limit).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job not found")]
    NotFound,

    #[error("Forbidden")]
    Forbidden,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryJobStore;

    #[tokio::test]
    async fn test_ownership_enforced() {
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::new("owner", "req", 1);
        store.create(&job, &[]).await.unwrap();
        let service = JobService::new(store);

        assert_eq!(service.get_result(job.id, "owner").await.unwrap().id, job.id);
        assert!(matches!(
            service.get_result(job.id, "intruder").await,
            Err(JobError::Forbidden)
        ));
        assert!(matches!(
            service.get_result(Uuid::new_v4(), "owner").await,
            Err(JobError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_limit_clamped() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..3 {
            store
                .create(&Job::new("owner", format!("req-{i}"), 1), &[])
                .await
                .unwrap();
        }
        let service = JobService::new(store);
        assert_eq!(service.list("owner", Some(0)).await.unwrap().len(), 1);
        assert_eq!(service.list("owner", None).await.unwrap().len(), 3);
        assert_eq!(service.list("owner", Some(500)).await.unwrap().len(), 3);
    }
}
