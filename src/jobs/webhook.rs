//! Webhook publisher
//!
//! Posts `{ "jobId", "storagePath" }` to a queue endpoint so a downstream
//! encoder can pick the job up.

use std::time::Duration;

use serde::Serialize;

use super::{EncodingJob, JobError};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobMessage<'a> {
    job_id: &'a str,
    storage_path: &'a str,
}

/// Publishes job ids over HTTP
#[derive(Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    /// Every publish is bounded by `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, JobError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobError::Publish(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn publish(&self, job: &EncodingJob) -> Result<(), JobError> {
        let message = JobMessage {
            job_id: &job.id,
            storage_path: &job.storage_path,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .map_err(|e| JobError::Publish(format!("Failed to call {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(JobError::Publish(format!(
                "{} returned {}: {}",
                self.url, status, body
            )));
        }

        tracing::debug!(job_id = %job.id, url = %self.url, "Published encoding job");
        Ok(())
    }
}
