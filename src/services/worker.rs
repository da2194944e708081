use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;
use uuid::Uuid;

use crate::models::classification::Classification;
use crate::services::classifier::Classifier;
use crate::services::queue::{JobQueue, QueueError, QueuedJob};
use crate::services::store::{JobStore, StoreError};
use crate::services::temp_files::TempImageSet;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded retry policy for classifier calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed,
    /// The job was not pending (duplicate delivery or already finished).
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Failed to serialize classification: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Runs a single job through claim, classification and the final transition.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    classifier: Arc<dyn Classifier>,
    retry: RetryPolicy,
    temp_dir: PathBuf,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        classifier: Arc<dyn Classifier>,
        retry: RetryPolicy,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            queue,
            classifier,
            retry,
            temp_dir,
        }
    }

    /// Process the next queued job for `consumer`.
    /// Returns `Ok(None)` if the queue is empty.
    pub async fn process_next(
        &self,
        consumer: &str,
    ) -> Result<Option<(Uuid, ProcessOutcome)>, WorkerError> {
        let delivery = match self.queue.dequeue(consumer).await? {
            Some(d) => d,
            None => return Ok(None),
        };

        let job_id = delivery.job.job_id;
        let result = self
            .process(&delivery.job)
            .instrument(tracing::info_span!(
                "job",
                job_id = %job_id,
                request_id = %delivery.job.request_id
            ))
            .await;

        // A job left in processing by a store error is expired by the sweeper;
        // redelivering the message would only be skipped.
        self.queue.ack(consumer, &delivery).await?;

        result.map(|outcome| Some((job_id, outcome)))
    }

    pub async fn process(&self, queued: &QueuedJob) -> Result<ProcessOutcome, WorkerError> {
        let job_id = queued.job_id;

        if !self.store.claim(job_id).await? {
            tracing::debug!(job_id = %job_id, "Job already claimed or finished, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        tracing::info!(job_id = %job_id, "Processing classification job");
        let start = Instant::now();
        let outcome = self.classify_with_retries(queued).await;
        let elapsed = start.elapsed();
        let processing_time_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

        metrics::histogram!("classification_processing_seconds").record(elapsed.as_secs_f64());

        let result = match outcome {
            Ok(classification) => {
                let value = serde_json::to_value(&classification)?;
                self.store.complete(job_id, value, processing_time_ms).await?;
                metrics::counter!("classification_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %job_id,
                    fossil = %classification.fossil_name,
                    confidence = classification.confidence,
                    processing_time_ms = processing_time_ms,
                    "Job completed successfully"
                );
                ProcessOutcome::Completed
            }
            Err(message) => {
                self.store
                    .fail(job_id, &message, Some(processing_time_ms))
                    .await?;
                metrics::counter!("classification_jobs_failed").increment(1);
                tracing::warn!(
                    job_id = %job_id,
                    error = %message,
                    processing_time_ms = processing_time_ms,
                    "Job failed"
                );
                ProcessOutcome::Failed
            }
        };

        if let Err(e) = self.store.delete_inputs(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to delete job inputs");
        }

        Ok(result)
    }

    /// Stage the inputs and call the classifier up to `max_attempts` times.
    /// Staged files are removed when this returns, whatever the outcome.
    async fn classify_with_retries(&self, queued: &QueuedJob) -> Result<Classification, String> {
        let inputs = self
            .store
            .load_inputs(queued.job_id)
            .await
            .map_err(|e| format!("Could not load job inputs: {e}"))?;
        if inputs.is_empty() {
            return Err("Job has no stored images".to_string());
        }

        let staged = TempImageSet::stage(&self.temp_dir, &queued.request_id, &inputs)
            .await
            .map_err(|e| format!("Could not stage images: {e}"))?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            metrics::counter!("classification_attempts_total").increment(1);
            match self.classifier.classify(staged.images()).await {
                Ok(classification) => {
                    if attempt > 1 {
                        tracing::info!(job_id = %queued.job_id, attempt, "Classifier succeeded after retry");
                    }
                    return Ok(classification);
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %queued.job_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Classifier call failed"
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        sleep(self.retry.backoff_after(attempt)).await;
                    }
                }
            }
        }

        Err(format!(
            "Classification failed after {max_attempts} attempts: {last_error}"
        ))
    }
}

/// One queue consumer. Processes at most one job at a time.
pub struct Worker {
    pub name: String,
    pub processor: Arc<JobProcessor>,
    pub poll_interval: Duration,
}

impl Worker {
    /// Run until `shutdown` flips to true. The current job always finishes first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.processor.queue.recover(&self.name).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(recovered = n, "Re-queued deliveries left by a previous run"),
            Err(e) => tracing::error!(error = %e, "Failed to recover in-flight deliveries"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.processor.process_next(&self.name).await {
                Ok(Some((job_id, outcome))) => {
                    tracing::debug!(job_id = %job_id, ?outcome, "Job processed, checking for next job");
                    continue;
                }
                Ok(None) => {
                    tracing::trace!("No jobs available, sleeping");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error processing job, will retry");
                }
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Worker stopped");
    }
}

/// A set of independent consumers sharing one processor.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(
        processor: Arc<JobProcessor>,
        concurrency: usize,
        name_prefix: &str,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let handles = (1..=concurrency.max(1))
            .map(|i| {
                let name = format!("{name_prefix}-{i}");
                tracing::info!(worker.name = %name, "Starting worker");
                let worker = Worker {
                    name: name.clone(),
                    processor: processor.clone(),
                    poll_interval,
                };
                let span = tracing::info_span!("worker", worker.name = %name);
                tokio::spawn(worker.run(receiver.clone()).instrument(span))
            })
            .collect();

        Self { handles, shutdown }
    }

    /// Ask every consumer to stop and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}
