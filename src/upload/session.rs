//! Upload Session Manager
//!
//! Owns the session registry and drives each upload through
//! initiate → chunks → complete:
//! - Session records live behind a [`SessionStore`] and are updated by
//!   compare-and-swap
//! - One async mutex per session serializes metadata updates and completion;
//!   chunk bytes are written outside the lock so distinct indices upload in
//!   parallel
//! - A chunk index joins `received_chunks` only after its file is synced

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::jobs::JobNotifier;

use super::chunk_store::{is_sha256_hex, sanitize_filename, ChunkStore};
use super::store::{InMemorySessionStore, SessionStore};
use super::types::{
    total_chunks, ChunkAck, CompletionResult, ContentRange, SessionDescriptor, SessionStatus,
    StatusResult, UploadError, UploadSession, COMPLETED_RETENTION_SECS, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_FILE_SIZE, MAX_TOTAL_CHUNKS, SESSION_EXPIRY_HOURS,
};

/// Tunables shared by all sessions
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Fixed chunk size in bytes
    pub chunk_size: u64,

    /// Largest declared file size accepted by `initiate`
    pub max_file_size: u64,

    /// Expiry horizon of a new session
    pub session_ttl: chrono::Duration,

    /// How long COMPLETED/FAILED sessions stay answerable before eviction
    pub completed_retention: chrono::Duration,

    /// Compare the merged file's SHA-256 with a SHA-256 shaped declared checksum
    pub verify_digest: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            session_ttl: chrono::Duration::hours(SESSION_EXPIRY_HOURS),
            completed_retention: chrono::Duration::seconds(COMPLETED_RETENTION_SECS),
            verify_digest: true,
        }
    }
}

/// Outcome of one reaper sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// IN_PROGRESS sessions past expiry that were marked FAILED
    pub expired: usize,

    /// Terminal sessions dropped from the registry
    pub evicted: usize,
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    store: Arc<dyn SessionStore>,
    chunk_store: ChunkStore,
    notifier: Arc<dyn JobNotifier>,

    /// Per-session locks
    locks: DashMap<Uuid, Arc<Mutex<()>>>,

    settings: SessionSettings,
}

impl SessionManager {
    /// Create a session manager backed by the in-memory registry
    pub fn new(
        chunk_store: ChunkStore,
        notifier: Arc<dyn JobNotifier>,
        settings: SessionSettings,
    ) -> Self {
        Self::with_store(
            Arc::new(InMemorySessionStore::new()),
            chunk_store,
            notifier,
            settings,
        )
    }

    /// Create a session manager on top of any session store
    pub fn with_store(
        store: Arc<dyn SessionStore>,
        chunk_store: ChunkStore,
        notifier: Arc<dyn JobNotifier>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                store,
                chunk_store,
                notifier,
                locks: DashMap::new(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new upload session and its staging directory
    pub async fn initiate(
        &self,
        filename: &str,
        declared_size: i64,
        expected_checksum: &str,
    ) -> Result<SessionDescriptor, UploadError> {
        if declared_size <= 0 {
            return Err(UploadError::InvalidArgument("Invalid file size".to_string()));
        }
        let declared_size = declared_size as u64;
        let settings = &self.inner.settings;
        if declared_size > settings.max_file_size {
            return Err(UploadError::InvalidArgument("File too large".to_string()));
        }
        if total_chunks(declared_size, settings.chunk_size) > MAX_TOTAL_CHUNKS {
            return Err(UploadError::InvalidArgument(
                "File needs too many chunks for the configured chunk size".to_string(),
            ));
        }
        let filename = sanitize_filename(filename)?;

        let session = UploadSession::new(
            filename,
            declared_size,
            expected_checksum.to_string(),
            settings.chunk_size,
            settings.session_ttl,
        );

        self.inner.chunk_store.prepare(session.id).await?;

        if let Err(e) = self.inner.store.insert(session.clone()).await {
            self.inner.chunk_store.cleanup(session.id).await;
            return Err(e);
        }

        tracing::info!(
            session_id = %session.id,
            file_name = %session.filename,
            file_size = session.declared_size,
            total_chunks = session.total_chunks,
            "Created upload session"
        );

        Ok(session.descriptor())
    }

    /// Accept one chunk.
    ///
    /// Re-sending an index that is already stored returns a duplicate ack
    /// without touching disk or session state. `declared_range` comes from a
    /// `Content-Range` header and must agree with the chunk's position.
    pub async fn submit_chunk(
        &self,
        id: &str,
        chunk_index: i64,
        data: &[u8],
        declared_range: Option<ContentRange>,
    ) -> Result<ChunkAck, UploadError> {
        let session_id = parse_session_id(id)?;
        let session = self.load(session_id).await?;
        self.ensure_open(&session).await?;

        let index = validate_index(&session, chunk_index)?;

        if session.received_chunks.contains(&index) {
            tracing::debug!(
                session_id = %session_id,
                chunk_index = index,
                "Duplicate chunk ignored"
            );
            return Ok(session.ack(index, true));
        }

        validate_chunk_len(&session, index, data.len() as u64, declared_range)?;

        // Written without holding the session lock
        if let Err(e) = self
            .inner
            .chunk_store
            .write_chunk(session_id, index, data)
            .await
        {
            // The session may have been finished while we were writing
            let current = self.load(session_id).await?;
            self.ensure_open(&current).await?;
            return Err(e);
        }

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        // A completion that ran during the write may have missed this chunk file
        let mut current = self.load_locked(session_id).await?;
        self.ensure_open(&current).await?;

        if current.received_chunks.contains(&index) {
            // A concurrent submission of the same index got there first
            return Ok(current.ack(index, true));
        }

        let version = current.version;
        current.received_chunks.insert(index);
        let updated = self.swap(version, current).await?;

        tracing::debug!(
            session_id = %session_id,
            chunk_index = index,
            chunks_received = updated.chunks_uploaded(),
            total_chunks = updated.total_chunks,
            "Chunk uploaded"
        );

        Ok(updated.ack(index, false))
    }

    /// Merge all chunks, move the file to storage and notify the job system.
    ///
    /// Storage failures leave the session IN_PROGRESS so the call can be
    /// retried. A merged file whose SHA-256 contradicts a SHA-256 declared at
    /// initiation fails the session.
    pub async fn complete(
        &self,
        id: &str,
        checksum: Option<&str>,
    ) -> Result<CompletionResult, UploadError> {
        let session_id = parse_session_id(id)?;

        // Unknown ids must not leave entries in the lock table
        self.load(session_id).await?;
        let lock = self.lock_for(session_id);
        let guard = lock.lock().await;

        let session = self.load_locked(session_id).await?;
        ensure_accepting(&session, Utc::now())?;

        if !session.is_complete() {
            return Err(UploadError::InvalidState("Not all chunks received".to_string()));
        }

        if let Some(checksum) = checksum.filter(|c| !c.is_empty()) {
            if checksum != session.expected_checksum {
                return Err(UploadError::InvalidArgument("Checksum mismatch".to_string()));
            }
        }

        tracing::info!(
            session_id = %session_id,
            file_name = %session.filename,
            chunks = session.total_chunks,
            "Assembling file from chunks"
        );

        let chunk_store = &self.inner.chunk_store;
        let merged = chunk_store
            .merge_in_order(session_id, session.total_chunks, &session.filename)
            .await?;

        if self.inner.settings.verify_digest
            && is_sha256_hex(&session.expected_checksum)
            && !merged.sha256.eq_ignore_ascii_case(&session.expected_checksum)
        {
            tracing::warn!(
                session_id = %session_id,
                expected = %session.expected_checksum,
                actual = %merged.sha256,
                "Merged file digest mismatch, failing session"
            );
            chunk_store.cleanup(session_id).await;
            let version = session.version;
            let mut failed = session;
            failed.status = SessionStatus::Failed;
            failed.finished_at = Some(Utc::now());
            self.swap(version, failed).await?;
            return Err(UploadError::InvalidArgument("Checksum mismatch".to_string()));
        }

        let final_path = match chunk_store.relocate(&merged.path, &session.filename).await {
            Ok(path) => path,
            Err(e) => {
                let _ = tokio::fs::remove_file(&merged.path).await;
                return Err(e);
            }
        };

        chunk_store.cleanup(session_id).await;

        let completed_at = Utc::now();
        let version = session.version;
        let mut completed = session;
        completed.status = SessionStatus::Completed;
        completed.finished_at = Some(completed_at);
        let completed = self.swap(version, completed).await?;

        drop(guard);

        tracing::info!(
            session_id = %session_id,
            file_name = %completed.filename,
            file_path = %final_path.display(),
            size = merged.size,
            "Upload session completed"
        );

        let job_id = self.notify(&final_path).await;

        Ok(CompletionResult {
            upload_id: completed.id.to_string(),
            file_path: final_path.to_string_lossy().to_string(),
            filename: completed.filename,
            file_size: completed.declared_size,
            completed_at,
            sha256: merged.sha256,
            job_id,
        })
    }

    /// Progress of an in-progress or failed session
    pub async fn status(&self, id: &str) -> Result<StatusResult, UploadError> {
        let session_id = parse_session_id(id)?;
        let session = self.load(session_id).await?;

        match session.status {
            SessionStatus::Completed => {
                Err(UploadError::InvalidState("Upload already completed".to_string()))
            }
            SessionStatus::InProgress | SessionStatus::Failed => Ok(session.status_result()),
        }
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Expire and evict sessions as of now
    pub async fn reap_expired(&self) -> ReapReport {
        self.reap_expired_at(Utc::now()).await
    }

    /// Mark IN_PROGRESS sessions past expiry FAILED and drop their staging
    /// data; evict terminal sessions older than the retention window.
    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        let ids = match self.inner.store.ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list upload sessions");
                return report;
            }
        };

        for id in ids {
            let lock = self.lock_for(id);
            let guard = lock.lock().await;

            let session = match self.inner.store.get(id).await {
                Ok(Some(session)) => session,
                Ok(None) => {
                    drop(guard);
                    self.inner.locks.remove(&id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Failed to load upload session");
                    continue;
                }
            };

            match session.status {
                SessionStatus::InProgress => {
                    if !session.is_expired_at(now) {
                        continue;
                    }
                    let removed = self.inner.chunk_store.cleanup(id).await;
                    let version = session.version;
                    let mut failed = session;
                    failed.status = SessionStatus::Failed;
                    failed.finished_at = Some(now);
                    match self.swap(version, failed).await {
                        Ok(_) => {
                            report.expired += 1;
                            tracing::debug!(
                                session_id = %id,
                                removed_files = removed,
                                "Expired upload session"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %id, error = %e, "Failed to expire upload session")
                        }
                    }
                }
                SessionStatus::Completed | SessionStatus::Failed => {
                    let finished_at = session.finished_at.unwrap_or(session.created_at);
                    if finished_at + self.inner.settings.completed_retention > now {
                        continue;
                    }
                    self.inner.chunk_store.cleanup(id).await;
                    match self.inner.store.remove(id).await {
                        Ok(_) => {
                            report.evicted += 1;
                            drop(guard);
                            self.inner.locks.remove(&id);
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %id, error = %e, "Failed to evict upload session")
                        }
                    }
                }
            }
        }

        if report.expired > 0 || report.evicted > 0 {
            tracing::info!(
                expired = report.expired,
                evicted = report.evicted,
                "Reaped upload sessions"
            );
        }

        report
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    async fn load(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Load a session while holding its lock. A session that vanished in the
    /// meantime has its lock entry dropped.
    async fn load_locked(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        let result = self.load(id).await;
        if let Err(UploadError::SessionNotFound(_)) = &result {
            self.inner.locks.remove(&id);
        }
        result
    }

    /// Reject work on sessions that no longer accept chunks. Terminal
    /// sessions own no staging data, so anything a late writer left behind
    /// is removed.
    async fn ensure_open(&self, session: &UploadSession) -> Result<(), UploadError> {
        let result = ensure_accepting(session, Utc::now());
        if result.is_err() && session.status.is_terminal() {
            let removed = self.inner.chunk_store.cleanup(session.id).await;
            if removed > 0 {
                tracing::debug!(
                    session_id = %session.id,
                    removed_files = removed,
                    "Removed staging data written after session finished"
                );
            }
        }
        result
    }

    async fn swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> Result<UploadSession, UploadError> {
        let id = session.id;
        self.inner
            .store
            .compare_and_swap(expected_version, session)
            .await?
            .ok_or_else(|| {
                UploadError::InvalidState(format!("Upload session {} was modified concurrently", id))
            })
    }

    async fn notify(&self, final_path: &Path) -> Option<String> {
        match self.inner.notifier.notify_file_ready(final_path).await {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                let err = UploadError::DependencyError(e.to_string());
                tracing::warn!(
                    file_path = %final_path.display(),
                    error = %err,
                    "Upload stored but job notification failed"
                );
                None
            }
        }
    }
}

fn parse_session_id(id: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(id).map_err(|_| UploadError::SessionNotFound(id.to_string()))
}

/// Only IN_PROGRESS sessions that have not expired accept work
fn ensure_accepting(session: &UploadSession, now: DateTime<Utc>) -> Result<(), UploadError> {
    match session.status {
        SessionStatus::Completed => {
            Err(UploadError::InvalidState("Upload already completed".to_string()))
        }
        SessionStatus::Failed => Err(UploadError::InvalidState("Upload failed".to_string())),
        SessionStatus::InProgress if session.is_expired_at(now) => {
            Err(UploadError::InvalidState("Upload session expired".to_string()))
        }
        SessionStatus::InProgress => Ok(()),
    }
}

fn validate_index(session: &UploadSession, chunk_index: i64) -> Result<u64, UploadError> {
    u64::try_from(chunk_index)
        .ok()
        .filter(|i| *i < session.total_chunks)
        .ok_or_else(|| UploadError::InvalidArgument("Invalid chunk index".to_string()))
}

fn validate_chunk_len(
    session: &UploadSession,
    index: u64,
    actual: u64,
    declared_range: Option<ContentRange>,
) -> Result<(), UploadError> {
    let expected = session.expected_chunk_len(index);

    if let Some(range) = declared_range {
        let matches = range.start == session.chunk_offset(index)
            && range.byte_len() == actual
            && range.total.map_or(true, |t| t == session.declared_size);
        if !matches {
            return Err(UploadError::InvalidArgument(
                "Content-Range does not match chunk".to_string(),
            ));
        }
    }

    if actual != expected {
        return Err(UploadError::InvalidArgument("Invalid chunk size".to_string()));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
