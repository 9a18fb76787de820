//! Application state management

use std::sync::Arc;

use crate::upload::SessionManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    sessions: SessionManager,
}

impl AppState {
    /// Create a new application state
    pub fn new(sessions: SessionManager) -> Self {
        Self {
            inner: Arc::new(AppStateInner { sessions }),
        }
    }

    /// Get the upload session manager
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }
}
