use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod admin;
pub mod classify;
pub mod extract;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Build the public API router. `/metrics` is mounted separately by the binary.
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    Router::new()
        .route("/health", get(health::health_check))
        .route("/classify-async/", post(classify::classify_async))
        .route("/classify-async", post(classify::classify_async))
        .route("/result/{job_id}", get(jobs::get_result))
        .route("/jobs", get(jobs::list_jobs))
        .route(
            "/admin/rate-limit/{user_id}/reset",
            post(admin::reset_rate_limit),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
