//! Shared test utilities: an in-memory application, token issuing,
//! multipart bodies and scripted classifiers.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use paleon::app_state::{ApiSettings, AppState};
use paleon::models::classification::Classification;
use paleon::models::job::{ImageInput, Job};
use paleon::models::tier::{Tier, TierLimits};
use paleon::routes;
use paleon::services::auth::JwtVerifier;
use paleon::services::classifier::{Classifier, ClassifierError};
use paleon::services::queue::{Delivery, JobQueue, MemoryJobQueue, QueueError, QueuedJob};
use paleon::services::rate_limit::{
    CounterStore, MemoryCounterStore, RateLimitError, RateLimiter,
};
use paleon::services::store::{JobStore, MemoryJobStore, StoreError};
use paleon::services::temp_files::StagedImage;
use paleon::services::worker::{JobProcessor, RetryPolicy};

pub const JWT_SECRET: &str = "integration-test-secret";
pub const BOUNDARY: &str = "paleon-test-boundary";

pub fn test_limits() -> TierLimits {
    TierLimits {
        free: 3,
        pro: 50,
        enterprise: 500,
    }
}

/// Router plus handles on every in-memory backend behind it.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryJobStore>,
    pub counters: Arc<MemoryCounterStore>,
    pub verifier: Arc<JwtVerifier>,
}

type StoreWrapper = Box<dyn FnOnce(Arc<MemoryJobStore>) -> Arc<dyn JobStore>>;

pub struct TestAppBuilder {
    limits: TierLimits,
    settings: ApiSettings,
    queue: Option<Arc<dyn JobQueue>>,
    wrap_store: Option<StoreWrapper>,
    counters: Option<Arc<dyn CounterStore>>,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            limits: test_limits(),
            settings: ApiSettings::default(),
            queue: None,
            wrap_store: None,
            counters: None,
        }
    }

    pub fn limits(mut self, limits: TierLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn admin_token(mut self, token: &str) -> Self {
        self.settings.admin_token = Some(token.to_string());
        self
    }

    pub fn conceal_job_existence(mut self) -> Self {
        self.settings.conceal_job_existence = true;
        self
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Put a different store in front of the in-memory one. `TestApp::store`
    /// still points at the in-memory store.
    pub fn wrap_store<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryJobStore>) -> Arc<dyn JobStore> + 'static,
    {
        self.wrap_store = Some(Box::new(wrap));
        self
    }

    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn build(self) -> TestApp {
        let store = Arc::new(MemoryJobStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let verifier = Arc::new(
            JwtVerifier::new(JWT_SECRET, Duration::from_secs(3600)).expect("verifier"),
        );
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryJobQueue::new()) as Arc<dyn JobQueue>);

        let job_store: Arc<dyn JobStore> = match self.wrap_store {
            Some(wrap) => wrap(store.clone()),
            None => store.clone(),
        };
        let counter_store: Arc<dyn CounterStore> = match self.counters {
            Some(counters) => counters,
            None => counters.clone(),
        };

        let state = AppState::new(
            job_store,
            queue,
            RateLimiter::new(counter_store, self.limits),
            verifier.clone(),
            self.settings,
        );

        TestApp {
            router: routes::router(state.clone()),
            state,
            store,
            counters,
            verifier,
        }
    }
}

impl TestApp {
    pub fn new() -> Self {
        TestAppBuilder::new().build()
    }

    pub fn token(&self, user_id: &str, tier: Tier) -> String {
        self.verifier
            .issue(user_id, &format!("{user_id}@example.com"), tier)
            .expect("issue token")
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.expect("router call")
    }

    /// A processor wired to the same store and queue as the API.
    pub fn processor(&self, classifier: Arc<dyn Classifier>, temp_dir: PathBuf) -> JobProcessor {
        JobProcessor::new(
            self.state.store.clone(),
            self.state.queue.clone(),
            classifier,
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
            },
            temp_dir,
        )
    }

    pub async fn job_count(&self, user_id: &str) -> usize {
        self.store
            .list_for_user(user_id, 1000)
            .await
            .expect("list jobs")
            .len()
    }
}

/// A tiny but genuine PNG.
pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([180, 160, 120]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub struct Part {
    pub field: &'static str,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Part {
    pub fn image(idx: usize) -> Self {
        Self {
            field: "image_files",
            filename: format!("fossil_{idx}.png"),
            content_type: "image/png".to_string(),
            bytes: png_bytes(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.bytes = bytes;
        self
    }
}

pub fn images(count: usize) -> Vec<Part> {
    (1..=count).map(Part::image).collect()
}

pub fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                part.field, part.filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", part.content_type).as_bytes());
        body.extend_from_slice(&part.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn classify_request(token: Option<&str>, parts: &[Part]) -> Request<Body> {
    let mut builder = Request::post("/classify-async/").header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
    );
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(multipart_body(parts)))
        .expect("request")
}

pub fn get_request(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

pub fn job_id_of(body: &serde_json::Value) -> Uuid {
    body["job_id"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("job_id in body")
}

pub fn ammonite() -> Classification {
    serde_json::from_value(serde_json::json!({
        "fossil_name": "Ammonite",
        "scientific_name": "Dactylioceras commune",
        "estimated_age": "Early Jurassic, ~180 Ma",
        "confidence": 0.93
    }))
    .expect("classification")
}

/// Fails the first `failures` calls, then returns [`ammonite`].
/// Records every staged path it was given and can hold each call open.
pub struct ScriptedClassifier {
    failures: u32,
    delay: Duration,
    pub calls: AtomicU32,
    pub seen_paths: Mutex<Vec<PathBuf>>,
}

impl ScriptedClassifier {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            seen_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, images: &[StagedImage]) -> Result<Classification, ClassifierError> {
        self.seen_paths
            .lock()
            .unwrap()
            .extend(images.iter().map(|i| i.path.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ClassifierError::Api {
                status: 502,
                body: format!("upstream error on call {call}"),
            });
        }
        let mut result = ammonite();
        result.metadata = Some(paleon::models::classification::ClassificationMetadata {
            num_images_analyzed: images.len(),
        });
        Ok(result)
    }
}

/// A queue whose enqueue always fails.
#[derive(Default)]
pub struct UnavailableQueue;

fn queue_down() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl JobQueue for UnavailableQueue {
    async fn enqueue(&self, _job: &QueuedJob) -> Result<(), QueueError> {
        Err(queue_down())
    }

    async fn dequeue(&self, _consumer: &str) -> Result<Option<Delivery>, QueueError> {
        Err(queue_down())
    }

    async fn ack(&self, _consumer: &str, _delivery: &Delivery) -> Result<(), QueueError> {
        Err(queue_down())
    }

    async fn recover(&self, _consumer: &str) -> Result<usize, QueueError> {
        Err(queue_down())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Err(queue_down())
    }

    async fn oldest_enqueued_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        Err(queue_down())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Err(queue_down())
    }
}

fn store_down() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

/// A job store whose every call fails.
#[derive(Default)]
pub struct UnavailableStore;

#[async_trait]
impl JobStore for UnavailableStore {
    async fn create(&self, _job: &Job, _inputs: &[ImageInput]) -> Result<(), StoreError> {
        Err(store_down())
    }

    async fn get(&self, _id: Uuid) -> Result<Option<Job>, StoreError> {
        Err(store_down())
    }

    async fn list_for_user(&self, _user_id: &str, _limit: u32) -> Result<Vec<Job>, StoreError> {
        Err(store_down())
    }

    async fn claim(&self, _id: Uuid) -> Result<bool, StoreError> {
        Err(store_down())
    }

    async fn complete(
        &self,
        _id: Uuid,
        _result: serde_json::Value,
        _processing_time_ms: i64,
    ) -> Result<(), StoreError> {
        Err(store_down())
    }

    async fn fail(
        &self,
        _id: Uuid,
        _error: &str,
        _processing_time_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        Err(store_down())
    }

    async fn load_inputs(&self, _id: Uuid) -> Result<Vec<ImageInput>, StoreError> {
        Err(store_down())
    }

    async fn delete_inputs(&self, _id: Uuid) -> Result<(), StoreError> {
        Err(store_down())
    }

    async fn take_stale_pending(
        &self,
        _enqueued_before: DateTime<Utc>,
        _now: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        Err(store_down())
    }

    async fn fail_stale_processing(
        &self,
        _started_before: DateTime<Utc>,
        _error: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        Err(store_down())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Err(store_down())
    }
}

/// Delegates to an in-memory store but loses the connection on `complete`.
pub struct CompleteFailsStore {
    pub inner: Arc<MemoryJobStore>,
}

#[async_trait]
impl JobStore for CompleteFailsStore {
    async fn create(&self, job: &Job, inputs: &[ImageInput]) -> Result<(), StoreError> {
        self.inner.create(job, inputs).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, StoreError> {
        self.inner.list_for_user(user_id, limit).await
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.claim(id).await
    }

    async fn complete(
        &self,
        _id: Uuid,
        _result: serde_json::Value,
        _processing_time_ms: i64,
    ) -> Result<(), StoreError> {
        Err(store_down())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        processing_time_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        self.inner.fail(id, error, processing_time_ms).await
    }

    async fn load_inputs(&self, id: Uuid) -> Result<Vec<ImageInput>, StoreError> {
        self.inner.load_inputs(id).await
    }

    async fn delete_inputs(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_inputs(id).await
    }

    async fn take_stale_pending(
        &self,
        enqueued_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.take_stale_pending(enqueued_before, now, limit).await
    }

    async fn fail_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.inner.fail_stale_processing(started_before, error).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

/// Rate-limit counters that cannot be reached.
#[derive(Default)]
pub struct UnavailableCounters;

fn counters_down() -> RateLimitError {
    RateLimitError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl CounterStore for UnavailableCounters {
    async fn increment_with_ceiling(
        &self,
        _key: &str,
        _ceiling: u32,
        _expires_at: DateTime<Utc>,
    ) -> Result<(bool, u32), RateLimitError> {
        Err(counters_down())
    }

    async fn decrement(&self, _key: &str) -> Result<(), RateLimitError> {
        Err(counters_down())
    }

    async fn clear(&self, _key: &str) -> Result<(), RateLimitError> {
        Err(counters_down())
    }
}
