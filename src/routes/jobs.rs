use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::{JobListResponse, JobResultResponse, ListJobsQuery};
use crate::services::auth::AuthenticatedUser;
use crate::services::jobs::JobError;

/// GET /result/{job_id}: poll a job owned by the caller.
pub async fn get_result(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResultResponse>, ApiError> {
    // Job ids are opaque to clients; anything unparseable simply does not exist.
    let job_id = Uuid::parse_str(&job_id).map_err(|_| JobError::NotFound)?;

    match state.jobs.get_result(job_id, &user.user_id).await {
        Ok(job) => Ok(Json(job.into())),
        Err(JobError::Forbidden) if state.settings.conceal_job_existence => {
            Err(JobError::NotFound.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /jobs?limit=N: the caller's most recent jobs.
pub async fn list_jobs(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let jobs: Vec<JobResultResponse> = state
        .jobs
        .list(&user.user_id, query.limit)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(Json(JobListResponse {
        count: jobs.len(),
        jobs,
    }))
}
