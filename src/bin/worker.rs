use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use paleon::config::AppConfig;
use paleon::db::{self, PgJobStore};
use paleon::routes::metrics::{prometheus_metrics, MetricsState};
use paleon::services::{
    classifier::VisionClient,
    queue::{JobQueue, RedisJobQueue},
    store::JobStore,
    sweeper::StaleJobSweeper,
    worker::{JobProcessor, WorkerPool},
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

    tracing::info!("Starting classification worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));
    let queue: Arc<dyn JobQueue> =
        Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    tracing::info!(model = %config.classifier_model, "Initializing vision classifier");
    let classifier = VisionClient::new(
        &config.classifier_base_url,
        &config.classifier_api_key,
        &config.classifier_model,
        Duration::from_secs(config.classifier_timeout_secs),
    )
    .expect("Failed to initialize classifier client");

    if let Some(addr) = config.worker_metrics_addr.clone() {
        let metrics_state = MetricsState {
            handle: Arc::new(prometheus_handle),
            queue: queue.clone(),
        };
        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(prometheus_metrics))
                .with_state(metrics_state);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("Worker metrics listening on {}", addr);
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(error = %e, "Metrics server error");
                    }
                }
                Err(e) => tracing::error!(error = %e, addr = %addr, "Failed to bind metrics listener"),
            }
        });
    }

    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        queue.clone(),
        Arc::new(classifier),
        config.retry_policy(),
        config.temp_dir.clone(),
    ));

    let pool = WorkerPool::start(
        processor,
        config.worker_concurrency,
        &config.worker_id,
        Duration::from_millis(config.worker_poll_interval_ms),
    );

    let (sweeper_shutdown, sweeper_rx) = watch::channel(false);
    let sweeper = StaleJobSweeper::new(
        store,
        queue,
        Duration::from_secs(config.stale_pending_secs),
        Duration::from_secs(config.job_time_limit_secs),
        Duration::from_secs(config.sweep_interval_secs),
    );
    let sweeper_task = tokio::spawn(sweeper.run(sweeper_rx));

    tracing::info!(
        concurrency = config.worker_concurrency,
        max_attempts = config.max_attempts,
        "Worker ready, processing jobs"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutdown requested, finishing in-flight jobs");
    let _ = sweeper_shutdown.send(true);
    pool.shutdown().await;
    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "Sweeper task panicked");
    }
    tracing::info!("Worker stopped");
}

fn describe_metrics() {
    metrics::describe_histogram!(
        "classification_processing_seconds",
        "Time to classify one job, including retries"
    );
    metrics::describe_counter!(
        "classification_jobs_completed",
        "Total classification jobs completed"
    );
    metrics::describe_counter!(
        "classification_jobs_failed",
        "Total classification jobs that failed"
    );
    metrics::describe_counter!(
        "classification_attempts_total",
        "Classifier calls, including retries"
    );
    metrics::describe_gauge!(
        "classification_queue_depth",
        "Current number of messages waiting in the job queue"
    );
}
