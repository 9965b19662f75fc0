//! Per-job pipeline: single-flight lock, OCR resolution, bounded fan-out to
//! every configured backend, and the delayed completion notice.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::answer::{Answer, AnswerOutcome, Backend};
use crate::models::event::HubEvent;
use crate::models::job::{Job, JobStatus};
use crate::services::cache::{job_lock_key, ocr_cache_key, SharedCache};
use crate::services::hub::{job_room, NotificationHub};
use crate::services::image_prep::{ImagePreparer, PrepareError};
use crate::services::ocr::{OcrEngine, OcrError};
use crate::services::prompt::build_prompt;
use crate::services::providers::{Provider, ProviderError};

const LOCK_SENTINEL: &str = "1";
const RESUME_BATCH: i64 = 500;

/// Timing and concurrency knobs for every pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub lock_ttl: Duration,
    pub ocr_timeout: Duration,
    pub ask_timeout: Duration,
    /// Upper bound on simultaneous backend calls within one job.
    pub fan_out_cap: usize,
    /// Deadline for the whole fan-out; outstanding calls are cancelled.
    pub job_timeout: Duration,
    pub max_concurrent_jobs: usize,
    /// `None` disables the OCR cache.
    pub ocr_cache_ttl: Option<Duration>,
    pub completion_poll_attempts: u32,
    pub completion_poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(600),
            ocr_timeout: Duration::from_secs(45),
            ask_timeout: Duration::from_secs(60),
            fan_out_cap: 3,
            job_timeout: Duration::from_secs(300),
            max_concurrent_jobs: 8,
            ocr_cache_ttl: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            completion_poll_attempts: 30,
            completion_poll_interval: Duration::from_secs(1),
        }
    }
}

/// How one triggered run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed(String),
    /// Another run holds the job lock, or the orchestrator is shutting down.
    Skipped,
    /// The job was already `completed` or `error`.
    AlreadyFinished,
}

/// Hard faults: any of these stop the run before the fan-out.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("image preparation failed: {0}")]
    Prepare(#[from] PrepareError),

    #[error("ocr failed: {0}")]
    Ocr(#[from] OcrError),

    #[error("ocr timed out after {0:?}")]
    OcrTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("pipeline panicked: {0}")]
    Panicked(String),
}

/// Handle to a scheduled run. Dropping it leaves the run going.
pub struct JobHandle {
    job_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<ProcessOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Cancel in-flight work for this run. Pending backend calls are recorded
    /// as errors and the completion notice goes out without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> ProcessOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => ProcessOutcome::Failed(format!("pipeline task aborted: {e}")),
        }
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    cache: Arc<dyn SharedCache>,
    preparer: Arc<dyn ImagePreparer>,
    ocr: Arc<dyn OcrEngine>,
    providers: Vec<Arc<dyn Provider>>,
    hub: NotificationHub,
    settings: PipelineSettings,
    jobs: Semaphore,
    shutdown: CancellationToken,
}

/// Schedules pipeline runs. Cheap to clone; clones share the job pool.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: Arc<dyn SharedCache>,
        preparer: Arc<dyn ImagePreparer>,
        ocr: Arc<dyn OcrEngine>,
        providers: Vec<Arc<dyn Provider>>,
        hub: NotificationHub,
        settings: PipelineSettings,
    ) -> Self {
        let jobs = Semaphore::new(settings.max_concurrent_jobs.max(1));
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                preparer,
                ocr,
                providers,
                hub,
                settings,
                jobs,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn provider_count(&self) -> usize {
        self.inner.providers.len()
    }

    /// Schedule a run for `job_id` and return at once.
    pub fn process(&self, job_id: Uuid) -> JobHandle {
        let cancel = self.inner.shutdown.child_token();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move { inner.run(job_id, token).await });

        JobHandle {
            job_id,
            cancel,
            task,
        }
    }

    /// Re-trigger every job left in `processing`, e.g. by a crash mid-run.
    pub async fn resume_unfinished(&self) -> Result<Vec<JobHandle>, StoreError> {
        let pending = self.inner.store.list_processing(RESUME_BATCH).await?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming_unfinished_jobs");
        }
        Ok(pending.into_iter().map(|id| self.process(id)).collect())
    }

    /// Cancel every running job and wait for their runs to return.
    pub async fn shutdown(&self) {
        tracing::info!("orchestrator_shutdown");
        self.inner.shutdown.cancel();

        let slots = self.inner.settings.max_concurrent_jobs.max(1) as u32;
        if let Ok(drained) = self.inner.jobs.acquire_many(slots).await {
            drained.forget();
        }
        self.inner.jobs.close();
    }
}

impl Inner {
    async fn run(&self, job_id: Uuid, cancel: CancellationToken) -> ProcessOutcome {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.jobs.acquire() => permit.ok(),
        };
        let Some(_permit) = permit else {
            tracing::debug!(job_id = %job_id, "job_not_started");
            metrics::counter!("jobs_skipped_total").increment(1);
            return ProcessOutcome::Skipped;
        };

        let lock_key = job_lock_key(job_id);
        match self
            .cache
            .set_if_absent(&lock_key, LOCK_SENTINEL, self.settings.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job_id, "job_lock_held");
                metrics::counter!("jobs_skipped_total").increment(1);
                return ProcessOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "job_lock_error");
                metrics::counter!("jobs_skipped_total").increment(1);
                return ProcessOutcome::Skipped;
            }
        }

        metrics::counter!("jobs_started_total").increment(1);
        let started = Instant::now();

        let result = AssertUnwindSafe(self.pipeline(job_id, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(panic.as_ref()))));

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(PipelineError::Cancelled) => {
                // Left in `processing` so a later resume picks it up.
                tracing::warn!(job_id = %job_id, "job_cancelled");
                ProcessOutcome::Failed(PipelineError::Cancelled.to_string())
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "job_failed");
                self.mark_error(job_id).await;
                ProcessOutcome::Failed(e.to_string())
            }
        };

        if let Err(e) = self.cache.delete(&lock_key).await {
            tracing::warn!(job_id = %job_id, error = %e, "job_lock_release_failed");
        }

        match &outcome {
            ProcessOutcome::Completed => {
                metrics::counter!("jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %job_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job_completed"
                );
            }
            ProcessOutcome::Failed(_) => metrics::counter!("jobs_failed_total").increment(1),
            ProcessOutcome::Skipped | ProcessOutcome::AlreadyFinished => {}
        }

        outcome
    }

    async fn pipeline(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PipelineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "job_already_finished");
            return Ok(ProcessOutcome::AlreadyFinished);
        }

        tracing::info!(job_id = %job_id, image_hash = %job.image_hash, "job_started");

        let text = self.resolve_ocr(&job, cancel).await?;
        self.hub
            .broadcast(&job_room(job_id), HubEvent::ocr_done(job_id, text.clone()));

        let prompt = build_prompt(&text);
        self.fan_out(job_id, &prompt, cancel).await;

        self.store.update_status(job_id, JobStatus::Completed).await?;
        self.spawn_completion_notice(job_id, cancel);

        Ok(ProcessOutcome::Completed)
    }

    /// Cached text for the image fingerprint, or a fresh OCR call. Either way
    /// the trimmed text ends up on the job record.
    async fn resolve_ocr(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let cache_key = ocr_cache_key(&job.image_hash);

        let cached = match self.settings.ocr_cache_ttl {
            Some(_) => match self.cache.get(&cache_key).await {
                Ok(hit) => hit.filter(|text| !text.trim().is_empty()),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "ocr_cache_read_failed");
                    None
                }
            },
            None => None,
        };

        let (text, from_cache) = match cached {
            Some(text) => {
                metrics::counter!("ocr_cache_hits_total").increment(1);
                tracing::info!(job_id = %job.id, "ocr_cache_hit");
                (text, true)
            }
            None => (self.read_image(job, cancel).await?, false),
        };

        let text = text.trim().to_string();
        self.store.update_ocr_text(job.id, &text).await?;

        if !from_cache && !text.is_empty() {
            if let Some(ttl) = self.settings.ocr_cache_ttl {
                if let Err(e) = self.cache.set(&cache_key, &text, ttl).await {
                    tracing::warn!(job_id = %job.id, error = %e, "ocr_cache_write_failed");
                }
            }
        }

        Ok(text)
    }

    async fn read_image(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let image = self.preparer.prepare(&job.image_path).await?;
        metrics::counter!("ocr_requests_total").increment(1);

        let limit = self.settings.ocr_timeout;
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            res = tokio::time::timeout(limit, self.ocr.read(&image.bytes, &image.mime)) => {
                res.map_err(|_| PipelineError::OcrTimeout(limit))??
            }
        };

        tracing::info!(
            job_id = %job.id,
            ocr_ms = started.elapsed().as_millis() as u64,
            chars = result.text.len(),
            "ocr_done"
        );
        Ok(result.text)
    }

    /// One task per backend, at most `min(cap, n)` in flight. Every backend
    /// gets exactly one answer row, success or not.
    async fn fan_out(&self, job_id: Uuid, prompt: &str, cancel: &CancellationToken) {
        if self.providers.is_empty() {
            tracing::warn!(job_id = %job_id, "no_providers_configured");
            return;
        }

        let scope = cancel.child_token();
        let gate = Arc::new(Semaphore::new(
            self.settings.fan_out_cap.min(self.providers.len()).max(1),
        ));
        let prompt: Arc<str> = Arc::from(prompt);
        let ask_timeout = self.settings.ask_timeout;

        let mut tasks = JoinSet::new();
        for provider in &self.providers {
            let provider = Arc::clone(provider);
            let gate = Arc::clone(&gate);
            let scope = scope.clone();
            let prompt = Arc::clone(&prompt);
            tasks.spawn(async move {
                let backend = provider.name();
                let (result, elapsed) =
                    ask_supervised(provider.as_ref(), &prompt, ask_timeout, &gate, &scope).await;
                (backend, result, elapsed)
            });
        }

        let deadline = tokio::time::sleep(self.settings.job_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((backend, result, elapsed))) => {
                        self.record_answer(job_id, backend, result, elapsed).await;
                    }
                    Some(Err(e)) => {
                        tracing::error!(job_id = %job_id, error = %e, "fan_out_task_aborted");
                    }
                },
                _ = &mut deadline, if !scope.is_cancelled() => {
                    tracing::warn!(
                        job_id = %job_id,
                        timeout_secs = self.settings.job_timeout.as_secs(),
                        "job_deadline_exceeded"
                    );
                    scope.cancel();
                }
            }
        }
    }

    async fn record_answer(
        &self,
        job_id: Uuid,
        backend: Backend,
        result: Result<Answer, ProviderError>,
        elapsed: Duration,
    ) {
        let provider = backend.to_string();
        metrics::histogram!("provider_latency_seconds", "provider" => provider.clone())
            .record(elapsed.as_secs_f64());

        let room = job_room(job_id);
        match result {
            Ok(answer) => {
                metrics::counter!("provider_answers_total", "provider" => provider, "outcome" => "ok")
                    .increment(1);
                tracing::info!(
                    job_id = %job_id,
                    provider = %backend,
                    answer = %answer.answer,
                    latency_ms = answer.latency_ms,
                    "provider_answered"
                );

                if let Err(e) = self
                    .store
                    .upsert_answer(job_id, backend, AnswerOutcome::Answered(&answer))
                    .await
                {
                    tracing::error!(job_id = %job_id, provider = %backend, error = %e, "answer_persist_failed");
                }
                self.hub
                    .broadcast(&room, HubEvent::answered(job_id, backend, answer));
            }
            Err(e) => {
                metrics::counter!("provider_answers_total", "provider" => provider, "outcome" => "error")
                    .increment(1);
                tracing::warn!(job_id = %job_id, provider = %backend, error = %e, "provider_ask_error");

                let reason = e.to_string();
                if let Err(e) = self
                    .store
                    .upsert_answer(
                        job_id,
                        backend,
                        AnswerOutcome::Failed {
                            reason: &reason,
                            latency_ms: elapsed.as_millis() as u64,
                        },
                    )
                    .await
                {
                    tracing::error!(job_id = %job_id, provider = %backend, error = %e, "answer_persist_failed");
                }
                self.hub.broadcast(&room, HubEvent::error(backend, reason));
            }
        }
    }

    fn spawn_completion_notice(&self, job_id: Uuid, cancel: &CancellationToken) {
        let hub = self.hub.clone();
        let cancel = cancel.clone();
        let attempts = self.settings.completion_poll_attempts;
        let interval = self.settings.completion_poll_interval;

        tokio::spawn(async move {
            let room = job_room(job_id);
            let present = hub
                .broadcast_when_subscribed(&room, HubEvent::completed(job_id), attempts, interval, &cancel)
                .await;
            tracing::debug!(job_id = %job_id, subscriber_present = present, "completion_broadcast");
        });
    }

    async fn mark_error(&self, job_id: Uuid) {
        if let Err(e) = self.store.update_status(job_id, JobStatus::Error).await {
            tracing::error!(job_id = %job_id, error = %e, "job_mark_error_failed");
        }
    }
}

/// One backend call under the fan-out gate, its own timeout and the shared
/// scope. A panic inside the call comes back as an error.
async fn ask_supervised(
    provider: &dyn Provider,
    prompt: &str,
    limit: Duration,
    gate: &Semaphore,
    scope: &CancellationToken,
) -> (Result<Answer, ProviderError>, Duration) {
    let permit = tokio::select! {
        biased;
        _ = scope.cancelled() => None,
        permit = gate.acquire() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return (Err(ProviderError::Cancelled), Duration::ZERO);
    };

    let started = Instant::now();
    let call = AssertUnwindSafe(provider.ask(prompt)).catch_unwind();
    let result = tokio::select! {
        _ = scope.cancelled() => Err(ProviderError::Cancelled),
        res = tokio::time::timeout(limit, call) => match res {
            Err(_) => Err(ProviderError::Timeout(limit)),
            Ok(Ok(answer)) => answer,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(provider = %provider.name(), panic = %message, "provider_panicked");
                Err(ProviderError::Panicked(message))
            }
        },
    };

    (result, started.elapsed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
