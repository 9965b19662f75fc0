use async_trait::async_trait;
use uuid::Uuid;

use crate::models::answer::{AnswerOutcome, Backend};
use crate::models::job::{Job, JobStatus};

/// Durable job records the pipeline reads and updates.
///
/// Implementations must keep status monotonic: once a job is `completed`
/// or `error`, `update_status` leaves it alone.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    async fn update_ocr_text(&self, job_id: Uuid, text: &str) -> Result<(), StoreError>;

    /// Insert or replace the single answer row for `(job_id, backend)`.
    async fn upsert_answer(
        &self,
        job_id: Uuid,
        backend: Backend,
        outcome: AnswerOutcome<'_>,
    ) -> Result<(), StoreError>;

    /// Jobs still marked `processing`, oldest first.
    async fn list_processing(&self, limit: i64) -> Result<Vec<Uuid>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown job status: {0}")]
    InvalidStatus(String),
}
