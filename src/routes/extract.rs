use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::services::auth::{bearer_token, AuthError, AuthenticatedUser};

/// Resolves the caller from `Authorization: Bearer <token>`.
/// Runs before the body is read, so unauthenticated uploads are rejected early.
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(AuthError::MissingToken)?;

        Ok(state.auth.verify(token).await?)
    }
}
