use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::ClassifyAsyncResponse;
use crate::models::job::ImageInput;
use crate::services::auth::AuthenticatedUser;
use crate::services::submission::normalize_content_type;

/// Multipart field carrying the images.
pub const IMAGE_FIELD: &str = "image_files";

/// POST /classify-async/: queue 1 to 5 fossil images for classification.
pub async fn classify_async(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ClassifyAsyncResponse>), ApiError> {
    let mut images = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let content_type = field
            .content_type()
            .map(normalize_content_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to read upload: {e}")))?;
        images.push(ImageInput::new(content_type, data.to_vec()));
    }

    let submission = state.submissions.submit(&user, images).await?;
    let job = submission.job;
    let image_count = job.image_count;

    Ok((
        StatusCode::ACCEPTED,
        Json(ClassifyAsyncResponse {
            success: true,
            job_id: job.id,
            status: job.status,
            message: format!(
                "Classification job queued with {image_count} image(s). Poll /result/{} for the outcome.",
                job.id
            ),
            request_id: job.request_id,
            rate_limit: submission.rate_limit,
        }),
    ))
}
