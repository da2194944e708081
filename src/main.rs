use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use paleon::app_state::AppState;
use paleon::config::AppConfig;
use paleon::db::{self, PgJobStore};
use paleon::routes::{self, metrics::MetricsState};
use paleon::services::{
    auth::JwtVerifier,
    queue::{JobQueue, RedisJobQueue},
    rate_limit::{RateLimiter, RedisCounterStore},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing paleon API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis job queue");
    let queue: Arc<dyn JobQueue> =
        Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    let counters = RedisCounterStore::new(&config.redis_url)
        .expect("Failed to initialize rate limit counters");
    let limits = config.tier_limits();
    tracing::info!(
        free = limits.free,
        pro = limits.pro,
        enterprise = limits.enterprise,
        "Daily classification limits"
    );
    let limiter = RateLimiter::new(Arc::new(counters), limits);

    let verifier = JwtVerifier::new(&config.jwt_secret, config.jwt_ttl())
        .expect("Failed to initialize token verifier");

    let state = AppState::new(
        Arc::new(PgJobStore::new(db_pool)),
        queue.clone(),
        limiter,
        Arc::new(verifier),
        config.api_settings(),
    );

    let metrics_state = MetricsState {
        handle: Arc::new(prometheus_handle),
        queue,
    };

    let app = routes::router(state).merge(
        Router::new()
            .route("/metrics", get(routes::metrics::prometheus_metrics))
            .with_state(metrics_state),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server stopped");
}

fn describe_metrics() {
    metrics::describe_counter!(
        "classification_jobs_total",
        "Total classification jobs accepted"
    );
    metrics::describe_counter!(
        "classification_requests_rate_limited",
        "Submissions rejected by the daily rate limit"
    );
    metrics::describe_gauge!(
        "classification_queue_depth",
        "Current number of messages waiting in the job queue"
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
