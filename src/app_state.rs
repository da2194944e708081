use std::sync::Arc;

use crate::services::{
    auth::TokenVerifier,
    jobs::JobService,
    queue::JobQueue,
    rate_limit::RateLimiter,
    store::JobStore,
    submission::SubmissionService,
};

/// HTTP-facing knobs taken from `AppConfig`.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// `None` disables the admin endpoints.
    pub admin_token: Option<String>,
    pub conceal_job_existence: bool,
    pub max_upload_bytes: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            admin_token: None,
            conceal_job_existence: false,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<dyn TokenVerifier>,
    pub submissions: Arc<SubmissionService>,
    pub jobs: Arc<JobService>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        limiter: RateLimiter,
        auth: Arc<dyn TokenVerifier>,
        settings: ApiSettings,
    ) -> Self {
        let limiter = Arc::new(limiter);
        Self {
            submissions: Arc::new(SubmissionService::new(
                store.clone(),
                queue.clone(),
                limiter.clone(),
            )),
            jobs: Arc::new(JobService::new(store.clone())),
            store,
            queue,
            limiter,
            auth,
            settings: Arc::new(settings),
        }
    }
}
