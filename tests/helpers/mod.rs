//! In-memory collaborators and a local mock backend for pipeline tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use chrono::Utc;
use uuid::Uuid;

use answer_relay::db::store::{JobStore, StoreError};
use answer_relay::models::answer::{Answer, AnswerOutcome, Backend};
use answer_relay::models::job::{Job, JobStatus};
use answer_relay::services::cache::{CacheError, SharedCache};
use answer_relay::services::hub::NotificationHub;
use answer_relay::services::image_prep::{ImagePreparer, PrepareError, PreparedImage};
use answer_relay::services::ocr::{OcrEngine, OcrError, OcrResult};
use answer_relay::services::orchestrator::{Orchestrator, PipelineSettings};
use answer_relay::services::providers::{Provider, ProviderError};

/// Answer row as the store last saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAnswer {
    pub answer: String,
    pub reason: Option<String>,
    pub latency_ms: u64,
}

/// Job store with the same monotonic-status rule as the Postgres one.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    answers: Mutex<HashMap<(Uuid, Backend), StoredAnswer>>,
    upserts: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_job(&self, image_hash: &str) -> Uuid {
        self.insert_with_status(image_hash, JobStatus::Processing)
    }

    pub fn insert_with_status(&self, image_hash: &str, status: JobStatus) -> Uuid {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            image_path: format!("uploads/{image_hash}.png"),
            image_hash: image_hash.to_string(),
            status,
            ocr_text: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        id
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.job(id).map(|j| j.status)
    }

    pub fn answer(&self, id: Uuid, backend: Backend) -> Option<StoredAnswer> {
        self.answers.lock().unwrap().get(&(id, backend)).cloned()
    }

    pub fn answer_count(&self, id: Uuid) -> usize {
        self.answers
            .lock()
            .unwrap()
            .keys()
            .filter(|(job_id, _)| *job_id == id)
            .count()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.job(job_id))
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            if job.status.can_transition_to(status) {
                job.status = status;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_ocr_text(&self, job_id: Uuid, text: &str) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.ocr_text = Some(text.to_string());
        }
        Ok(())
    }

    async fn upsert_answer(
        &self,
        job_id: Uuid,
        backend: Backend,
        outcome: AnswerOutcome<'_>,
    ) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.answers.lock().unwrap().insert(
            (job_id, backend),
            StoredAnswer {
                answer: outcome.answer_text().to_string(),
                reason: outcome.reason_text().map(str::to_string),
                latency_ms: outcome.latency_ms(),
            },
        );
        Ok(())
    }

    async fn list_processing(&self, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut pending: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|j| j.id)
            .collect())
    }
}

/// Shared cache without expiry.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn set_if_absent(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Hands back the path bytes as a fake JPEG.
pub struct FakePreparer;

#[async_trait]
impl ImagePreparer for FakePreparer {
    async fn prepare(&self, path: &str) -> Result<PreparedImage, PrepareError> {
        Ok(PreparedImage {
            bytes: path.as_bytes().to_vec(),
            mime: "image/jpeg".to_string(),
        })
    }
}

/// OCR engine returning fixed text after an optional delay, counting calls.
pub struct ScriptedOcr {
    text: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedOcr {
    pub fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: Some(text.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            text: Some(text.to_string()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            text: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn read(&self, _image: &[u8], _mime: &str) -> Result<OcrResult, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.text {
            Some(text) => Ok(OcrResult {
                text: text.clone(),
                raw: String::new(),
            }),
            None => Err(OcrError::Status(500)),
        }
    }
}

/// Behaviour of one fake backend.
#[derive(Clone)]
pub enum Script {
    Answer(&'static str),
    Fail(u16),
    Panic,
    Hang,
}

pub struct ScriptedProvider {
    backend: Backend,
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(backend: Backend, script: Script) -> Arc<Self> {
        Self::delayed(backend, script, Duration::ZERO)
    }

    pub fn delayed(backend: Backend, script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend,
            script,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> Backend {
        self.backend
    }

    async fn ask(&self, _prompt: &str) -> Result<Answer, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.script {
            Script::Answer(text) => Ok(Answer {
                answer: text.to_string(),
                raw: text.to_string(),
                latency_ms: 1,
                ..Answer::default()
            }),
            Script::Fail(status) => Err(ProviderError::Status {
                backend: self.backend,
                status: *status,
            }),
            Script::Panic => panic!("{} blew up", self.backend),
            Script::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Settings with a short completion poll so tests never wait on it.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        ocr_timeout: Duration::from_secs(2),
        ask_timeout: Duration::from_secs(2),
        job_timeout: Duration::from_secs(5),
        completion_poll_attempts: 5,
        completion_poll_interval: Duration::from_millis(10),
        ..PipelineSettings::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub cache: Arc<InMemoryCache>,
    pub ocr: Arc<ScriptedOcr>,
    pub hub: NotificationHub,
    pub orchestrator: Orchestrator,
}

pub fn harness(ocr: Arc<ScriptedOcr>, providers: Vec<Arc<dyn Provider>>) -> Harness {
    harness_with(ocr, providers, fast_settings())
}

pub fn harness_with(
    ocr: Arc<ScriptedOcr>,
    providers: Vec<Arc<dyn Provider>>,
    settings: PipelineSettings,
) -> Harness {
    let store = InMemoryJobStore::new();
    let cache = InMemoryCache::new();
    let hub = NotificationHub::new();
    let orchestrator = Orchestrator::new(
        store.clone(),
        cache.clone(),
        Arc::new(FakePreparer),
        ocr.clone(),
        providers,
        hub.clone(),
        settings,
    );
    Harness {
        store,
        cache,
        ocr,
        hub,
        orchestrator,
    }
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_mock(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("mock backend address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

/// One request seen by a scripted backend.
#[derive(Debug, Clone)]
pub struct Captured {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

pub type Recorder = Arc<Mutex<Vec<Captured>>>;

/// Backend that answers the n-th request with `replies[n]`; the last reply
/// repeats. Every request is recorded.
pub async fn scripted_backend(replies: Vec<(StatusCode, String)>) -> (String, Recorder) {
    assert!(!replies.is_empty(), "scripted backend needs at least one reply");
    let recorder: Recorder = Arc::default();
    let replies = Arc::new(replies);

    let seen = recorder.clone();
    let router = Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: String| {
        let seen = seen.clone();
        let replies = replies.clone();
        async move {
            let mut log = seen.lock().unwrap();
            let reply = replies[log.len().min(replies.len() - 1)].clone();
            log.push(Captured {
                path: uri.path().to_string(),
                headers: headers
                    .iter()
                    .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
                    .collect(),
                body,
            });
            reply
        }
    });

    (spawn_mock(router).await, recorder)
}

pub fn ok_json(value: serde_json::Value) -> (StatusCode, String) {
    (StatusCode::OK, value.to_string())
}
