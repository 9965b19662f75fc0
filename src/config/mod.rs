use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::PipelineSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Redis connection string for the job lock and OCR cache
    pub redis_url: String,

    /// A backend joins the fan-out only when its key is set
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,

    pub gemini_api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Return canned answers instead of calling any backend
    #[serde(default)]
    pub provider_dry_run: bool,

    /// Vision OCR key; falls back to `openai_api_key`
    pub ocr_openai_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub ocr_openai_model: String,
    #[serde(default = "default_ocr_rate")]
    pub ocr_rps: u32,
    #[serde(default = "default_ocr_rate")]
    pub ocr_burst: u32,
    #[serde(default = "default_max_retries")]
    pub provider_max_retries: u32,

    #[serde(default = "default_img_max_w")]
    pub ocr_img_max_w: u32,
    #[serde(default = "default_img_quality")]
    pub ocr_img_quality: u8,
    #[serde(default = "default_true")]
    pub ocr_img_grayscale: bool,
    /// 0 disables OCR caching
    #[serde(default = "default_ocr_cache_ttl_secs")]
    pub ocr_cache_ttl_secs: u64,

    #[serde(default = "default_job_lock_ttl_secs")]
    pub job_lock_ttl_secs: u64,
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_fan_out_cap")]
    pub fan_out_cap: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_completion_poll_attempts")]
    pub completion_poll_attempts: u32,
    #[serde(default = "default_completion_poll_interval_ms")]
    pub completion_poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_ocr_rate() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_img_max_w() -> u32 {
    1024
}

fn default_img_quality() -> u8 {
    60
}

fn default_true() -> bool {
    true
}

fn default_ocr_cache_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_job_lock_ttl_secs() -> u64 {
    600
}

fn default_ocr_timeout_secs() -> u64 {
    45
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_fan_out_cap() -> usize {
    3
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_completion_poll_attempts() -> u32 {
    30
}

fn default_completion_poll_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Key used for vision OCR.
    pub fn ocr_key(&self) -> Option<&str> {
        self.ocr_openai_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .or_else(|| self.openai_api_key.as_deref().filter(|k| !k.is_empty()))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            lock_ttl: Duration::from_secs(self.job_lock_ttl_secs),
            ocr_timeout: Duration::from_secs(self.ocr_timeout_secs),
            ask_timeout: Duration::from_secs(self.provider_timeout_secs),
            fan_out_cap: self.fan_out_cap.max(1),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            ocr_cache_ttl: (self.ocr_cache_ttl_secs > 0)
                .then(|| Duration::from_secs(self.ocr_cache_ttl_secs)),
            completion_poll_attempts: self.completion_poll_attempts,
            completion_poll_interval: Duration::from_millis(self.completion_poll_interval_ms),
        }
    }
}
