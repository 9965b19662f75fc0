use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Answer text stored for a backend whose call failed.
pub const ERROR_ANSWER: &str = "ERROR";

/// External answer-generation backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Backend {
    #[serde(rename = "OPENAI")]
    #[strum(serialize = "OPENAI")]
    OpenAi,
    #[serde(rename = "CLAUDE")]
    #[strum(serialize = "CLAUDE")]
    Anthropic,
    #[serde(rename = "GEMINI")]
    #[strum(serialize = "GEMINI")]
    Gemini,
}

/// A backend reply normalized into a canonical shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Self-reported confidence in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Untouched backend text, kept for audit.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

/// What gets written for one (job, backend) pair.
#[derive(Debug, Clone, Copy)]
pub enum AnswerOutcome<'a> {
    Answered(&'a Answer),
    /// Failed call; `latency_ms` is the wall time spent before it gave up.
    Failed { reason: &'a str, latency_ms: u64 },
}

impl AnswerOutcome<'_> {
    pub fn answer_text(&self) -> &str {
        match self {
            AnswerOutcome::Answered(answer) => &answer.answer,
            AnswerOutcome::Failed { .. } => ERROR_ANSWER,
        }
    }

    pub fn reason_text(&self) -> Option<&str> {
        match self {
            AnswerOutcome::Answered(answer) => answer.reason.as_deref(),
            AnswerOutcome::Failed { reason, .. } => Some(reason),
        }
    }

    pub fn latency_ms(&self) -> u64 {
        match self {
            AnswerOutcome::Answered(answer) => answer.latency_ms,
            AnswerOutcome::Failed { latency_ms, .. } => *latency_ms,
        }
    }
}
