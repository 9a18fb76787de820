//! Session Reaper
//!
//! Background sweep that fails abandoned uploads and evicts finished ones.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::session::{ReapReport, SessionManager};

/// Periodically reaps expired upload sessions
pub struct SessionReaper {
    manager: SessionManager,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(manager: SessionManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run a single sweep
    pub async fn sweep(&self) -> ReapReport {
        self.manager.reap_expired().await
    }

    /// Start the background sweep loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(interval_secs = self.interval.as_secs(), "Session reaper started");

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::LogJobNotifier;
    use crate::upload::{ChunkStore, SessionSettings, SessionStatus};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_spawned_reaper_fails_expired_sessions() {
        let temp = TempDir::new().unwrap();
        let manager = SessionManager::new(
            ChunkStore::new(temp.path().join("tmp"), temp.path().join("storage")),
            Arc::new(LogJobNotifier),
            SessionSettings {
                chunk_size: 4,
                session_ttl: chrono::Duration::seconds(-1),
                ..SessionSettings::default()
            },
        );
        let d = manager.initiate("a.bin", 8, "").await.unwrap();

        let handle = SessionReaper::new(manager.clone(), Duration::from_millis(10)).spawn();

        let mut status = manager.status(&d.upload_id).await.unwrap().status;
        for _ in 0..100 {
            if status == SessionStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = manager.status(&d.upload_id).await.unwrap().status;
        }
        handle.abort();

        assert_eq!(status, SessionStatus::Failed);
        let session_dir = temp.path().join("tmp").join(&d.upload_id);
        assert!(!session_dir.exists());
    }
}
