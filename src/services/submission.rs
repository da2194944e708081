use chrono::NaiveDate;
use image::ImageFormat;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{ImageInput, Job};
use crate::models::rate_limit::RateLimitSnapshot;
use crate::services::auth::AuthenticatedUser;
use crate::services::queue::{JobQueue, QueueError, QueuedJob};
use crate::services::rate_limit::{RateLimitError, RateLimiter};
use crate::services::store::{JobStore, StoreError};

pub const MAX_IMAGES: usize = 5;

/// Declared content types accepted for upload.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("At least one image is required")]
    NoImages,

    #[error("At most 5 images are allowed, got {0}")]
    TooManyImages(usize),

    #[error("Image {index} is empty")]
    EmptyFile { index: usize },

    #[error("Image {index} has unsupported content type {content_type:?}")]
    UnsupportedContentType { index: usize, content_type: String },

    #[error("Image {index} is not a valid JPEG, PNG or WebP file")]
    NotAnImage { index: usize },
}

/// Check count, declared type and actual bytes of every upload.
pub fn validate_images(images: &[ImageInput]) -> Result<(), ValidationError> {
    if images.is_empty() {
        return Err(ValidationError::NoImages);
    }
    if images.len() > MAX_IMAGES {
        return Err(ValidationError::TooManyImages(images.len()));
    }

    for (i, image) in images.iter().enumerate() {
        let index = i + 1;
        if image.bytes.is_empty() {
            return Err(ValidationError::EmptyFile { index });
        }
        if !ALLOWED_CONTENT_TYPES.contains(&image.content_type.as_str()) {
            return Err(ValidationError::UnsupportedContentType {
                index,
                content_type: image.content_type.clone(),
            });
        }
        match image::guess_format(&image.bytes) {
            Ok(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) => {}
            _ => return Err(ValidationError::NotAnImage { index }),
        }
    }
    Ok(())
}

/// Strip parameters and normalise case of a multipart content type.
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[derive(Debug)]
pub struct Submission {
    pub job: Job,
    pub rate_limit: RateLimitSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Daily classification limit reached")]
    RateLimited(RateLimitSnapshot),

    #[error(transparent)]
    RateLimiter(#[from] RateLimitError),

    #[error("Failed to record job: {0}")]
    Store(#[source] StoreError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[source] QueueError),
}

/// Validates, rate-limits, records and enqueues classification requests.
pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    limiter: Arc<RateLimiter>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            store,
            queue,
            limiter,
        }
    }

    /// Validation runs before the rate limiter so rejected uploads never
    /// consume quota. The job record is written before the queue message, so
    /// a delivered message always has a job behind it.
    pub async fn submit(
        &self,
        user: &AuthenticatedUser,
        images: Vec<ImageInput>,
    ) -> Result<Submission, SubmissionError> {
        validate_images(&images)?;

        let decision = self
            .limiter
            .check_and_increment(&user.user_id, user.tier)
            .await?;
        if !decision.allowed {
            metrics::counter!("classification_requests_rate_limited").increment(1);
            return Err(SubmissionError::RateLimited(decision.snapshot));
        }

        let request_id = Uuid::new_v4().to_string();
        let job = Job::new(&user.user_id, &request_id, images.len() as i32);

        if let Err(e) = self.store.create(&job, &images).await {
            tracing::error!(
                request_id = %request_id,
                user_id = %user.user_id,
                error = %e,
                "Failed to create job record"
            );
            self.refund(&user.user_id, decision.day).await;
            return Err(SubmissionError::Store(e));
        }

        if let Err(e) = self.queue.enqueue(&QueuedJob::for_job(&job)).await {
            tracing::error!(
                job_id = %job.id,
                request_id = %request_id,
                error = %e,
                "Failed to enqueue job"
            );
            if let Err(store_err) = self
                .store
                .fail(job.id, &format!("Job could not be queued: {e}"), None)
                .await
            {
                tracing::error!(job_id = %job.id, error = %store_err, "Failed to mark unqueued job as failed");
            } else if let Err(delete_err) = self.store.delete_inputs(job.id).await {
                tracing::warn!(job_id = %job.id, error = %delete_err, "Failed to delete job inputs");
            }
            self.refund(&user.user_id, decision.day).await;
            return Err(SubmissionError::Queue(e));
        }

        metrics::counter!("classification_jobs_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            request_id = %request_id,
            user_id = %user.user_id,
            image_count = job.image_count,
            remaining = decision.snapshot.remaining,
            "Classification job queued"
        );

        Ok(Submission {
            job,
            rate_limit: decision.snapshot,
        })
    }

    async fn refund(&self, user_id: &str, day: NaiveDate) {
        if let Err(e) = self.limiter.refund(user_id, day).await {
            tracing::warn!(user_id = %user_id, day = %day, error = %e, "Failed to refund rate limit slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0";

    fn png() -> ImageInput {
        ImageInput::new("image/png", PNG.to_vec())
    }

    #[test]
    fn test_count_bounds() {
        assert_eq!(validate_images(&[]), Err(ValidationError::NoImages));
        assert!(validate_images(&vec![png(); 5]).is_ok());
        assert_eq!(
            validate_images(&vec![png(); 6]),
            Err(ValidationError::TooManyImages(6))
        );
    }

    #[test]
    fn test_content_type_allow_list() {
        let gif = ImageInput::new("image/gif", b"GIF89a".to_vec());
        assert!(matches!(
            validate_images(&[png(), gif]),
            Err(ValidationError::UnsupportedContentType { index: 2, .. })
        ));
        assert!(validate_images(&[ImageInput::new("image/jpeg", JPEG.to_vec())]).is_ok());
    }

    #[test]
    fn test_bytes_must_sniff_as_image() {
        let fake = ImageInput::new("image/png", b"definitely not a png".to_vec());
        assert_eq!(
            validate_images(&[fake]),
            Err(ValidationError::NotAnImage { index: 1 })
        );
        let empty = ImageInput::new("image/png", Vec::new());
        assert_eq!(
            validate_images(&[empty]),
            Err(ValidationError::EmptyFile { index: 1 })
        );
    }

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(normalize_content_type("Image/PNG; charset=binary"), "image/png");
        assert_eq!(normalize_content_type(" image/jpeg "), "image/jpeg");
    }
}
