//! Encoding job records

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{JobError, JobNotifier, WebhookPublisher};

/// Encoding job record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EncodingJob {
    pub id: String,
    pub storage_path: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Lifecycle of an encoding job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Creates encoding jobs for stored files and publishes them
#[derive(Clone)]
pub struct EncodingJobService {
    pool: SqlitePool,
    publisher: Option<WebhookPublisher>,
}

impl EncodingJobService {
    pub fn new(pool: SqlitePool, publisher: Option<WebhookPublisher>) -> Self {
        Self { pool, publisher }
    }

    /// Insert a PENDING job for a stored file
    pub async fn create_job(&self, storage_path: &str) -> Result<EncodingJob, JobError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO encoding_jobs (id, storage_path, status, error_message, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(storage_path)
        .bind(JobStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| JobError::NotFound(id))
    }

    /// Get a job by id
    pub async fn get_job(&self, id: &str) -> Result<Option<EncodingJob>, JobError> {
        let job = sqlx::query_as::<_, EncodingJob>(
            r#"
            SELECT id, storage_path, status, error_message, created_at, updated_at
            FROM encoding_jobs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Record a status change reported by the encoder
    pub async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<EncodingJob, JobError> {
        let result = sqlx::query(
            r#"
            UPDATE encoding_jobs
            SET status = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id.to_string()));
        }

        self.get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl JobNotifier for EncodingJobService {
    async fn notify_file_ready(&self, storage_path: &Path) -> Result<String, JobError> {
        let job = self.create_job(&storage_path.to_string_lossy()).await?;

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(&job).await {
                self.update_job_status(&job.id, JobStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        }

        tracing::info!(
            job_id = %job.id,
            storage_path = %job.storage_path,
            "Encoding job created"
        );

        Ok(job.id)
    }
}
