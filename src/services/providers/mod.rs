//! Answer-generation backends.
//!
//! Every backend issues a single request per [`Provider::ask`] and never
//! retries; timeouts and cancellation belong to the caller. Extracted reply
//! text is always funnelled through [`parse_answer`](crate::services::parser::parse_answer).

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::RequestBuilder;

use crate::config::AppConfig;
use crate::models::answer::{Answer, Backend};

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// One answer-generation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> Backend;

    /// Ask the backend to answer `prompt`. Dropping the future cancels the call.
    async fn ask(&self, prompt: &str) -> Result<Answer, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{backend} request failed: {source}")]
    Http {
        backend: Backend,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend} http {status}")]
    Status { backend: Backend, status: u16 },

    #[error("{backend} returned an unreadable body: {source}")]
    Decode {
        backend: Backend,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} empty content")]
    Empty(Backend),

    #[error("{0} blocked: {1}")]
    Blocked(Backend, String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("internal fault: {0}")]
    Panicked(String),
}

/// Build the fan-out set: a backend takes part only when its key is configured.
pub fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(key) = config.openai_api_key.as_deref().filter(|k| !k.is_empty()) {
        providers.push(Arc::new(
            OpenAiProvider::new(key, &config.openai_model).dry_run(config.provider_dry_run),
        ));
    }
    if let Some(key) = config.anthropic_api_key.as_deref().filter(|k| !k.is_empty()) {
        providers.push(Arc::new(
            AnthropicProvider::new(key, &config.anthropic_model).dry_run(config.provider_dry_run),
        ));
    }
    if let Some(key) = config.gemini_api_key.as_deref().filter(|k| !k.is_empty()) {
        providers.push(Arc::new(
            GeminiProvider::new(key, &config.gemini_model).dry_run(config.provider_dry_run),
        ));
    }

    tracing::info!(
        providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
        dry_run = config.provider_dry_run,
        "providers_configured"
    );
    providers
}

/// Canned reply used in dry-run mode, so integration runs spend no quota.
pub(crate) fn simulated_answer(backend: Backend, prompt: &str) -> Answer {
    tracing::info!(provider = %backend, "provider_dry_run");
    Answer {
        answer: "simulated answer".to_string(),
        reason: Some("simulated reason".to_string()),
        options: vec!["A".into(), "B".into(), "C".into(), "D".into()],
        confidence: Some(0.9),
        raw: String::new(),
        latency_ms: 1,
        usage: Some(serde_json::json!({
            "prompt_tokens": prompt.split_whitespace().count(),
            "completion_tokens": 5,
        })),
    }
}

/// Send `request` and return the body of a 2xx response.
pub(crate) async fn execute(backend: Backend, request: RequestBuilder) -> Result<String, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|source| ProviderError::Http { backend, source })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| ProviderError::Http { backend, source })?;

    tracing::debug!(provider = %backend, status = status.as_u16(), body_len = body.len(), "provider_response");

    if !status.is_success() {
        tracing::error!(
            provider = %backend,
            status = status.as_u16(),
            body = %truncate_for_log(&body),
            "provider_http_error"
        );
        return Err(ProviderError::Status {
            backend,
            status: status.as_u16(),
        });
    }

    Ok(body)
}

fn truncate_for_log(body: &str) -> String {
    body.chars().take(512).collect()
}
