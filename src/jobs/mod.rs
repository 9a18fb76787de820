//! Job hand-off for completed uploads
//!
//! When an upload is merged and stored, the file's final path is handed to a
//! [`JobNotifier`]. The default deployment records an encoding job in SQLite
//! and optionally publishes its id to a webhook queue.

mod encoding;
mod webhook;

pub use encoding::{EncodingJob, EncodingJobService, JobStatus};
pub use webhook::WebhookPublisher;

use std::path::Path;

use async_trait::async_trait;
use uuid::Uuid;

/// Job notification errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Receives the storage path of every completed upload
#[async_trait]
pub trait JobNotifier: Send + Sync {
    /// Announce a stored file. Returns the id of the job created for it.
    async fn notify_file_ready(&self, storage_path: &Path) -> Result<String, JobError>;
}

/// Notifier that only logs. Used when no job database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogJobNotifier;

#[async_trait]
impl JobNotifier for LogJobNotifier {
    async fn notify_file_ready(&self, storage_path: &Path) -> Result<String, JobError> {
        let job_id = Uuid::new_v4().to_string();
        tracing::info!(
            job_id = %job_id,
            storage_path = %storage_path.display(),
            "File ready for processing"
        );
        Ok(job_id)
    }
}
