use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{execute, simulated_answer, Provider, ProviderError};
use crate::models::answer::{Answer, Backend};
use crate::services::parser::parse_answer;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicProvider {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    dry_run: bool,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

impl AnthropicProvider {
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
impl Provider for AnthropicProvider {
    fn name(&self) -> Backend {
        Backend::Anthropic
    }

    async fn ask(&self, prompt: &str) -> Result<Answer, ProviderError> {
        if self.dry_run {
            return Ok(simulated_answer(self.name(), prompt));
        }

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 512,
            "messages": [{"role": "user", "content": prompt}],
        });

        let started = Instant::now();
        let request = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let raw = execute(self.name(), request).await?;

        let parsed: MessagesResponse =
            serde_json::from_str(&raw).map_err(|source| ProviderError::Decode {
                backend: self.name(),
                source,
            })?;

        // Thinking and tool blocks may precede the reply text.
        let text = parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text" && !block.text.trim().is_empty())
            .map(|block| block.text)
            .ok_or(ProviderError::Empty(self.name()))?;

        let mut answer = parse_answer(&text);
        answer.latency_ms = started.elapsed().as_millis() as u64;
        answer.usage = parsed.usage;
        Ok(answer)
    }
}
