use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::app_state::ApiSettings;
use crate::models::tier::TierLimits;
use crate::services::worker::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue and rate-limit counters
    pub redis_url: String,

    /// HS256 secret for locally-issued access tokens
    pub jwt_secret: String,

    /// Lifetime of issued access tokens
    #[serde(default = "default_jwt_ttl_minutes")]
    pub jwt_ttl_minutes: u64,

    /// OpenAI-compatible API root for the vision model
    #[serde(default = "default_classifier_base_url")]
    pub classifier_base_url: String,

    pub classifier_api_key: String,

    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,

    #[serde(default = "default_classifier_timeout_secs")]
    pub classifier_timeout_secs: u64,

    /// Daily quotas. No defaults: the operator must choose them.
    pub free_daily_limit: u32,
    pub pro_daily_limit: u32,
    pub enterprise_daily_limit: u32,

    /// Classifier attempts per job, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles for each later one
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// Stable consumer name prefix; each consumer owns a Redis processing list
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Prometheus listener for the worker process
    #[serde(default)]
    pub worker_metrics_addr: Option<String>,

    /// Pending jobs older than this are re-enqueued by the sweeper
    #[serde(default = "default_stale_pending_secs")]
    pub stale_pending_secs: u64,

    /// Processing jobs older than this are failed by the sweeper
    #[serde(default = "default_job_time_limit_secs")]
    pub job_time_limit_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Directory for staged uploads while a job is being classified
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Enables the admin rate-limit reset endpoint when set
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Answer ownership mismatches with 404 instead of 403
    #[serde(default)]
    pub conceal_job_existence: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_jwt_ttl_minutes() -> u64 {
    1440
}

fn default_classifier_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_classifier_model() -> String {
    "gpt-4o".to_string()
}

fn default_classifier_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_id() -> String {
    "worker".to_string()
}

fn default_stale_pending_secs() -> u64 {
    600
}

fn default_job_time_limit_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp_images")
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn tier_limits(&self) -> TierLimits {
        TierLimits {
            free: self.free_daily_limit,
            pro: self.pro_daily_limit,
            enterprise: self.enterprise_daily_limit,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            admin_token: self.admin_token.clone().filter(|t| !t.is_empty()),
            conceal_job_existence: self.conceal_job_existence,
            max_upload_bytes: self.max_upload_bytes,
        }
    }

    pub fn jwt_ttl(&self) -> Duration {
        Duration::from_secs(self.jwt_ttl_minutes * 60)
    }
}
