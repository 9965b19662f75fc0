use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{execute, simulated_answer, Provider, ProviderError};
use crate::models::answer::{Answer, Backend};
use crate::services::parser::parse_answer;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Responses API client.
pub struct OpenAiProvider {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    dry_run: bool,
}

impl OpenAiProvider {
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
impl Provider for OpenAiProvider {
    fn name(&self) -> Backend {
        Backend::OpenAi
    }

    async fn ask(&self, prompt: &str) -> Result<Answer, ProviderError> {
        if self.dry_run {
            return Ok(simulated_answer(self.name(), prompt));
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": prompt,
            "temperature": 0.0,
            "max_output_tokens": 256,
        });

        let started = Instant::now();
        let request = self
            .http
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let raw = execute(self.name(), request).await?;

        let value: Value = serde_json::from_str(&raw).map_err(|source| ProviderError::Decode {
            backend: self.name(),
            source,
        })?;

        let text = extract_openai_text(&value).ok_or(ProviderError::Empty(self.name()))?;

        let mut answer = parse_answer(&text);
        answer.latency_ms = started.elapsed().as_millis() as u64;
        answer.usage = value.get("usage").filter(|u| u.is_object()).cloned();
        Ok(answer)
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ResponsesShape {
    output_text: Option<String>,
    output: Vec<OutputItem>,
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OutputItem {
    content: Vec<OutputContent>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OutputContent {
    text: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ChatMessage {
    content: Option<String>,
}

/// Reply text from the Responses API, falling back to the chat-completions shape.
fn extract_openai_text(value: &Value) -> Option<String> {
    let shape = ResponsesShape::deserialize(value).unwrap_or_default();
    let non_blank = |s: &String| !s.trim().is_empty();

    if let Some(text) = shape.output_text.filter(non_blank) {
        return Some(text);
    }

    if let Some(text) = shape
        .output
        .into_iter()
        .next()
        .and_then(|item| item.content.into_iter().filter_map(|c| c.text).find(non_blank))
    {
        return Some(text);
    }

    shape
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(non_blank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_text_wins() {
        let value = json!({"output_text": "{\"answer\":\"A\"}", "choices": [{"message": {"content": "B"}}]});
        assert_eq!(extract_openai_text(&value).as_deref(), Some("{\"answer\":\"A\"}"));
    }

    #[test]
    fn test_nested_output_content() {
        let value = json!({
            "output": [{"content": [{"type": "reasoning", "text": "  "}, {"type": "output_text", "text": "C"}]}]
        });
        assert_eq!(extract_openai_text(&value).as_deref(), Some("C"));
    }

    #[test]
    fn test_chat_completion_fallback() {
        let value = json!({"choices": [{"message": {"content": "Final answer: 3"}}]});
        assert_eq!(extract_openai_text(&value).as_deref(), Some("Final answer: 3"));
    }

    #[test]
    fn test_nothing_usable() {
        assert_eq!(extract_openai_text(&json!({"output": []})), None);
        assert_eq!(extract_openai_text(&json!("not an object")), None);
    }

    #[tokio::test]
    async fn test_dry_run_skips_network() {
        let provider = OpenAiProvider::new("unused", "gpt-4o-mini")
            .with_base_url("http://127.0.0.1:9")
            .dry_run(true);
        let answer = provider.ask("two words").await.unwrap();
        assert_eq!(answer.answer, "simulated answer");
        assert_eq!(answer.usage.unwrap()["prompt_tokens"], 2);
    }
}
