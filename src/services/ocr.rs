use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const OCR_INSTRUCTION: &str = "Extract plain text (OCR). Return ONLY the raw text (no explanation).";
const DEFAULT_RPS: u32 = 2;
const DEFAULT_BURST: u32 = 2;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Text recognized from an image.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub raw: String,
}

/// Vision text extraction.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn read(&self, image: &[u8], mime: &str) -> Result<OcrResult, OcrError>;
}

/// OpenAI vision client used for OCR.
///
/// Calls share one token bucket so concurrent jobs stay inside the key's
/// quota. Rate-limited (429) replies and transport failures are retried with
/// exponential backoff; any other non-2xx status fails immediately.
pub struct OpenAiVisionClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_retries: u32,
    backoff_base: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiVisionClient {
    /// Zero values for `rps`, `burst` or `max_retries` fall back to the defaults.
    pub fn new(api_key: &str, model: &str, rps: u32, burst: u32, max_retries: u32) -> Self {
        let rps = NonZeroU32::new(rps)
            .or(NonZeroU32::new(DEFAULT_RPS))
            .unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst)
            .or(NonZeroU32::new(DEFAULT_BURST))
            .unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rps).allow_burst(burst);

        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            limiter: RateLimiter::direct(quota),
            max_retries: if max_retries == 0 {
                DEFAULT_MAX_RETRIES
            } else {
                max_retries
            },
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }
}

#[async_trait]
impl OcrEngine for OpenAiVisionClient {
    async fn read(&self, image: &[u8], mime: &str) -> Result<OcrResult, OcrError> {
        self.limiter.until_ready().await;

        let data_url = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": OCR_INSTRUCTION},
                    {"type": "image_url", "image_url": {"url": data_url, "detail": "low"}},
                ],
            }],
            "temperature": 0.0,
            "max_tokens": 512,
        });
        let url = format!("{}/v1/chat/completions", self.base_url);

        let started = Instant::now();
        let mut last_error = OcrError::RateLimited { attempts: 0 };

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }

            let response = match self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "ocr_transport_retry");
                    last_error = OcrError::Http(e);
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                tracing::warn!(attempt, status = status.as_u16(), "ocr_429_retry");
                last_error = OcrError::RateLimited {
                    attempts: attempt + 1,
                };
                continue;
            }

            let raw = response.text().await?;
            if !status.is_success() {
                return Err(OcrError::Status(status.as_u16()));
            }

            let parsed: ChatResponse = serde_json::from_str(&raw)?;
            let Some(choice) = parsed.choices.into_iter().next() else {
                return Err(OcrError::EmptyResult);
            };
            let text = choice.message.content.unwrap_or_default();

            tracing::debug!(
                latency_ms = started.elapsed().as_millis() as u64,
                chars = text.chars().count(),
                attempts = attempt + 1,
                "ocr_ok"
            );
            return Ok(OcrResult { text, raw });
        }

        Err(last_error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR backend returned http {0}")]
    Status(u16),

    #[error("OCR backend still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Failed to parse OCR response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("OCR backend returned no choices")]
    EmptyResult,
}
