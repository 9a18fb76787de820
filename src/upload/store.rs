//! Session Store
//!
//! Storage capability for upload session records. The manager only talks to
//! this trait, so the in-memory registry can be swapped for a shared durable
//! store without touching session logic.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::types::{UploadError, UploadSession};

/// Keyed storage for upload sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails if the id is already taken.
    async fn insert(&self, session: UploadSession) -> Result<(), UploadError>;

    /// Get a snapshot of a session
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError>;

    /// Replace a session if its stored version still equals `expected_version`.
    ///
    /// On success the stored record carries `expected_version + 1` and is
    /// returned. Returns `Ok(None)` on a version conflict.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> Result<Option<UploadSession>, UploadError>;

    /// Remove a session, returning it if present
    async fn remove(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError>;

    /// Ids of all stored sessions
    async fn ids(&self) -> Result<Vec<Uuid>, UploadError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local session registry. Lost on restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, UploadSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: UploadSession) -> Result<(), UploadError> {
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => Err(UploadError::InvalidState(format!(
                "Upload session {} already exists",
                session.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut session: UploadSession,
    ) -> Result<Option<UploadSession>, UploadError> {
        let mut stored = self
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| UploadError::SessionNotFound(session.id.to_string()))?;

        if stored.version != expected_version {
            return Ok(None);
        }

        session.version = expected_version + 1;
        *stored = session.clone();
        Ok(Some(session))
    }

    async fn remove(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.sessions.remove(&id).map(|(_, session)| session))
    }

    async fn ids(&self) -> Result<Vec<Uuid>, UploadError> {
        Ok(self.sessions.iter().map(|entry| *entry.key()).collect())
    }
}
