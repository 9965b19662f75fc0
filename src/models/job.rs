use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of an image-to-answers job.
///
/// Transitions are one-way: `processing -> completed | error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Whether a job currently in `self` may be moved to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Processing, _) => true,
            (current, next) => current == next,
        }
    }
}

/// A job as seen by the pipeline. The record itself is owned by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_path: String,
    /// Stable hash of the source image bytes; keys the OCR cache.
    pub image_hash: String,
    pub status: JobStatus,
    pub ocr_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
