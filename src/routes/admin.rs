use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use sha2::{Digest, Sha256};

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::RateLimitResetResponse;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// POST /admin/rate-limit/{user_id}/reset: clear today's counter for a user.
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RateLimitResetResponse>, ApiError> {
    let Some(expected) = state.settings.admin_token.as_deref() else {
        return Err(ApiError::NotFound("Not found".to_string()));
    };

    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !tokens_match(provided, expected) {
        tracing::warn!(user_id = %user_id, "Rejected admin rate-limit reset");
        return Err(ApiError::Forbidden);
    }

    state.limiter.reset(&user_id).await.map_err(|e| {
        tracing::error!(user_id = %user_id, error = %e, "Failed to reset rate limit");
        ApiError::Unavailable("Rate limiter is unavailable, try again later".to_string())
    })?;

    tracing::info!(user_id = %user_id, "Daily rate limit reset by admin");
    Ok(Json(RateLimitResetResponse {
        user_id,
        reset: true,
    }))
}

/// Compare fixed-length digests so the time taken does not depend on where
/// the tokens first differ or on their lengths.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
