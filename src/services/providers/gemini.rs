use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{execute, simulated_answer, Provider, ProviderError};
use crate::models::answer::{Answer, Backend};
use crate::services::parser::parse_answer;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini `generateContent` client. Asks for a JSON reply at temperature 0.
pub struct GeminiProvider {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    dry_run: bool,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Part {
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: String,
}

impl GeminiProvider {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            dry_run: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> Backend {
        Backend::Gemini
    }

    async fn ask(&self, prompt: &str) -> Result<Answer, ProviderError> {
        if self.dry_run {
            return Ok(simulated_answer(self.name(), prompt));
        }

        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.0,
                "maxOutputTokens": 256,
                "responseMimeType": "application/json",
            },
        });

        let started = Instant::now();
        let request = self
            .http
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body);
        let raw = execute(self.name(), request).await?;

        let parsed: GenerateResponse =
            serde_json::from_str(&raw).map_err(|source| ProviderError::Decode {
                backend: self.name(),
                source,
            })?;

        if let Some(reason) = parsed
            .prompt_feedback
            .map(|f| f.block_reason)
            .filter(|r| !r.is_empty())
        {
            return Err(ProviderError::Blocked(self.name(), reason));
        }

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::Empty(self.name()))?;

        let mut answer = parse_answer(&text);
        answer.latency_ms = started.elapsed().as_millis() as u64;
        answer.usage = parsed.usage_metadata;
        Ok(answer)
    }
}
