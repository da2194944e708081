use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::job::store_timestamp;
use crate::services::queue::{JobQueue, QueuedJob};
use crate::services::store::{JobStore, StoreError};

/// Error recorded on jobs whose worker disappeared mid-run.
pub const WORKER_LOST_ERROR: &str = "Worker lost while processing";

const REQUEUE_BATCH: i64 = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: Vec<Uuid>,
    pub expired: Vec<Uuid>,
}

/// Repairs jobs that no worker will ever pick up on its own:
/// pending jobs whose queue message was lost, and processing jobs
/// that outlived the time limit.
pub struct StaleJobSweeper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    stale_pending_after: Duration,
    job_time_limit: Duration,
    interval: Duration,
}

impl StaleJobSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        stale_pending_after: Duration,
        job_time_limit: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            stale_pending_after,
            job_time_limit,
            interval,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        let expired = self
            .store
            .fail_stale_processing(now - to_chrono(self.job_time_limit), WORKER_LOST_ERROR)
            .await?;
        for id in &expired {
            if let Err(e) = self.store.delete_inputs(*id).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to delete inputs of expired job");
            }
        }
        if !expired.is_empty() {
            metrics::counter!("classification_jobs_failed").increment(expired.len() as u64);
            tracing::warn!(count = expired.len(), "Failed jobs that exceeded the time limit");
        }
        report.expired = expired;

        // A job last enqueued at or after the queue head may still have its
        // message waiting; only jobs behind the head have lost theirs.
        let mut cutoff = now - to_chrono(self.stale_pending_after);
        match self.queue.oldest_enqueued_at().await {
            Ok(Some(head)) => cutoff = cutoff.min(head),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Could not inspect queue, skipping re-enqueue");
                return Ok(report);
            }
        }

        let stale = self
            .store
            .take_stale_pending(cutoff, store_timestamp(now), REQUEUE_BATCH)
            .await?;
        for job in stale {
            // A duplicate message is harmless: the second claim is a no-op.
            match self.queue.enqueue(&QueuedJob::for_job(&job)).await {
                Ok(()) => report.requeued.push(job.id),
                Err(e) => {
                    // Taken jobs left unsent come round again next window.
                    tracing::error!(job_id = %job.id, error = %e, "Failed to re-enqueue stale job");
                    break;
                }
            }
        }
        if !report.requeued.is_empty() {
            tracing::info!(count = report.requeued.len(), "Re-enqueued stale pending jobs");
        }

        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Stale job sweeper started"
        );
        loop {
            if let Err(e) = self.sweep_once(Utc::now()).await {
                tracing::error!(error = %e, "Stale job sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("Stale job sweeper stopped");
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{ImageInput, Job, JobStatus};
    use crate::services::queue::MemoryJobQueue;
    use crate::services::store::MemoryJobStore;

    fn sweeper(store: Arc<MemoryJobStore>, queue: Arc<MemoryJobQueue>) -> StaleJobSweeper {
        StaleJobSweeper::new(
            store,
            queue,
            Duration::from_secs(600),
            Duration::from_secs(1800),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_requeues_old_pending_jobs_only() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let job = Job::new("u", "req-old", 1);
        store
            .create(&job, &[ImageInput::new("image/png", vec![1])])
            .await
            .unwrap();

        let s = sweeper(store.clone(), queue.clone());

        let report = s.sweep_once(Utc::now()).await.unwrap();
        assert!(report.requeued.is_empty());

        let later = Utc::now() + chrono::Duration::minutes(11);
        let report = s.sweep_once(later).await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let delivery = queue.dequeue("w").await.unwrap().unwrap();
        assert_eq!(delivery.job.job_id, job.id);
        assert_eq!(delivery.job.request_id, "req-old");
    }

    #[tokio::test]
    async fn test_waiting_message_is_not_duplicated_by_repeated_sweeps() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let job = Job::new("u", "req-backlog", 1);
        store
            .create(&job, &[ImageInput::new("image/png", vec![1])])
            .await
            .unwrap();
        queue.enqueue(&QueuedJob::for_job(&job)).await.unwrap();

        let s = sweeper(store.clone(), queue.clone());
        let start = Utc::now();
        for minutes in 11..=15 {
            let report = s
                .sweep_once(start + chrono::Duration::minutes(minutes))
                .await
                .unwrap();
            assert!(report.requeued.is_empty());
        }
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lost_message_is_requeued_once_per_window() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let job = Job::new("u", "req-lost", 1);
        store
            .create(&job, &[ImageInput::new("image/png", vec![1])])
            .await
            .unwrap();

        let s = sweeper(store.clone(), queue.clone());
        let start = Utc::now();
        let mut requeued = 0;
        for minutes in 11..=15 {
            requeued += s
                .sweep_once(start + chrono::Duration::minutes(minutes))
                .await
                .unwrap()
                .requeued
                .len();
        }
        assert_eq!(requeued, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);

        // The resent message is lost as well; the next window resends it.
        queue.dequeue("gone").await.unwrap();
        let report = s
            .sweep_once(start + chrono::Duration::minutes(22))
            .await
            .unwrap();
        assert_eq!(report.requeued, vec![job.id]);
    }

    #[tokio::test]
    async fn test_expires_processing_jobs_past_time_limit() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let job = Job::new("u", "req", 1);
        store
            .create(&job, &[ImageInput::new("image/png", vec![1])])
            .await
            .unwrap();
        assert!(store.claim(job.id).await.unwrap());

        let s = sweeper(store.clone(), queue.clone());
        assert!(s.sweep_once(Utc::now()).await.unwrap().expired.is_empty());

        let later = Utc::now() + chrono::Duration::minutes(31);
        let report = s.sweep_once(later).await.unwrap();
        assert_eq!(report.expired, vec![job.id]);

        let failed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(WORKER_LOST_ERROR));
        assert_eq!(store.inputs_retained().await, 0);
    }

    #[tokio::test]
    async fn test_terminal_jobs_untouched() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let job = Job::new("u", "req", 1);
        store.create(&job, &[]).await.unwrap();
        store.claim(job.id).await.unwrap();
        store
            .complete(job.id, serde_json::json!({"fossil_name": "Ammonite"}), 5)
            .await
            .unwrap();

        let s = sweeper(store.clone(), queue.clone());
        let report = s
            .sweep_once(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
