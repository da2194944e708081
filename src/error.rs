use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::models::rate_limit::RateLimitSnapshot;
use crate::services::auth::AuthError;
use crate::services::jobs::JobError;
use crate::services::submission::{SubmissionError, ValidationError};

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("You do not have access to this resource")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("Daily classification limit reached. Try again after {}", .0.reset_at)]
    RateLimited(RateLimitSnapshot),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitSnapshot>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::UnsupportedMediaType(_) => "unsupported_media_type",
            ApiError::RateLimited(_) => "rate_limit_exceeded",
            ApiError::Unavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            rate_limit: match &self {
                ApiError::RateLimited(snapshot) => Some(*snapshot),
                _ => None,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Config(msg) => {
                tracing::error!(error = %msg, "Token verifier misconfigured");
                ApiError::Internal("Authentication is unavailable".to_string())
            }
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

impl From<SubmissionError> for ApiError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::Validation(
                e @ (ValidationError::UnsupportedContentType { .. }
                | ValidationError::NotAnImage { .. }),
            ) => ApiError::UnsupportedMediaType(e.to_string()),
            SubmissionError::Validation(e) => ApiError::Validation(e.to_string()),
            SubmissionError::RateLimited(snapshot) => ApiError::RateLimited(snapshot),
            SubmissionError::RateLimiter(e) => {
                tracing::error!(error = %e, "Rate limiter unavailable");
                ApiError::Unavailable("Rate limiter is unavailable, try again later".to_string())
            }
            SubmissionError::Store(_) | SubmissionError::Queue(_) => ApiError::Unavailable(
                "Could not queue the classification job, try again later".to_string(),
            ),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound => ApiError::NotFound("Job not found".to_string()),
            JobError::Forbidden => ApiError::Forbidden,
            JobError::Store(e) => {
                tracing::error!(error = %e, "Job store unavailable");
                ApiError::Unavailable("Job store is unavailable, try again later".to_string())
            }
        }
    }
}
