use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::store::{JobStore, StoreError};
use crate::models::answer::{AnswerOutcome, Backend};
use crate::models::job::{Job, JobStatus};

/// Postgres-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new job in `processing`.
    pub async fn create_job(
        &self,
        user_id: Uuid,
        image_path: &str,
        image_hash: &str,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (user_id, image_path, image_hash, status)
            VALUES ($1, $2, $3, 'processing')
            RETURNING id, user_id, image_path, image_hash, status, ocr_text, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(image_path)
        .bind(image_hash)
        .fetch_one(&self.pool)
        .await?;

        job_from_row(&row)
    }

    /// Answer text per backend for one job, in insertion order.
    pub async fn answers_for_job(&self, job_id: Uuid) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source, answer_text
            FROM answers
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<(String, String), StoreError> {
                Ok((r.try_get("source")?, r.try_get("answer_text")?))
            })
            .collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status =
        JobStatus::from_str(&status_str).map_err(|_| StoreError::InvalidStatus(status_str))?;

    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        image_path: row.try_get("image_path")?,
        image_hash: row.try_get("image_hash")?,
        status,
        ocr_text: row.try_get("ocr_text")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, image_path, image_hash, status, ocr_text, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        // Terminal rows only accept a repeat of their own status.
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1,
                updated_at = NOW()
            WHERE id = $2
              AND (status = 'processing' OR status = $1)
            "#,
        )
        .bind(status.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_ocr_text(&self, job_id: Uuid, text: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET ocr_text = $1,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(text)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_answer(
        &self,
        job_id: Uuid,
        backend: Backend,
        outcome: AnswerOutcome<'_>,
    ) -> Result<(), StoreError> {
        let (options, confidence, raw, usage) = match outcome {
            AnswerOutcome::Answered(answer) => (
                (!answer.options.is_empty()).then(|| serde_json::json!(answer.options)),
                answer.confidence,
                Some(answer.raw.as_str()),
                answer.usage.clone(),
            ),
            AnswerOutcome::Failed { .. } => (None, None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO answers
                (job_id, source, answer_text, reason_text, options, confidence, raw_text, latency_ms, token_usage)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id, source) DO UPDATE
            SET answer_text = EXCLUDED.answer_text,
                reason_text = EXCLUDED.reason_text,
                options = EXCLUDED.options,
                confidence = EXCLUDED.confidence,
                raw_text = EXCLUDED.raw_text,
                latency_ms = EXCLUDED.latency_ms,
                token_usage = EXCLUDED.token_usage,
                updated_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(backend.to_string())
        .bind(outcome.answer_text())
        .bind(outcome.reason_text())
        .bind(options)
        .bind(confidence)
        .bind(raw)
        .bind(outcome.latency_ms() as i64)
        .bind(usage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_processing(&self, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'processing'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get("id").map_err(StoreError::from))
            .collect()
    }
}
