//! Upload types for the chunked upload protocol

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Largest accepted upload: 50GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// Upper bound on chunks per session, whatever the chunk size
pub const MAX_TOTAL_CHUNKS: u64 = 100_000;

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// How long a finished session keeps answering late polls: 1 hour
pub const COMPLETED_RETENTION_SECS: i64 = 60 * 60;

/// Number of chunks needed to carry `file_size` bytes.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size)
}

// ============================================================================
// Initiate Types
// ============================================================================

/// Query parameters of `POST /initiate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    /// Target file name (untrusted)
    pub filename: String,

    /// Total file size in bytes, as declared by the client
    pub file_size: i64,

    /// Client-declared checksum of the whole file
    #[serde(default)]
    pub checksum: String,
}

/// Returned when a session is created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Byte range declared by a `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive end offset
    pub end: u64,
    /// `None` when the client sent `*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse the `bytes start-end/total` form. Returns `None` on any malformed input.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;

        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        // Rejects inverted ranges and ranges whose length does not fit in u64
        end.checked_sub(start)?.checked_add(1)?;

        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };

        Some(Self { start, end, total })
    }

    /// Number of bytes covered by the range
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Acknowledgement for one submitted chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub upload_id: String,
    pub chunk_index: u64,
    pub chunks_uploaded: u64,
    pub total_chunks: u64,
    pub is_duplicate: bool,
}

// ============================================================================
// Completion Types
// ============================================================================

/// Query parameters of `POST /complete/{uploadId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Result of a successful merge and relocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub upload_id: String,
    pub file_path: String,
    pub filename: String,
    pub file_size: u64,
    pub completed_at: DateTime<Utc>,

    /// SHA-256 of the merged file, hex encoded
    pub sha256: String,

    /// Job id handed back by the job notifier, if it succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub upload_id: String,
    pub status: SessionStatus,
    pub chunks_uploaded: u64,
    pub total_chunks: u64,
    pub missing_chunks: Vec<u64>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Sanitized target file name
    pub filename: String,

    /// Total file size in bytes
    pub declared_size: u64,

    /// Checksum declared at initiation
    pub expected_checksum: String,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// ceil(declared_size / chunk_size), fixed at creation
    pub total_chunks: u64,

    /// Indices of chunks durably staged
    pub received_chunks: BTreeSet<u64>,

    /// Current status
    pub status: SessionStatus,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Session expiry time
    pub expires_at: DateTime<Utc>,

    /// When the session reached COMPLETED or FAILED
    pub finished_at: Option<DateTime<Utc>>,

    /// Bumped on every stored mutation; used for compare-and-swap
    pub version: u64,
}

impl UploadSession {
    /// Create a new upload session. `filename` must already be sanitized.
    pub fn new(
        filename: String,
        declared_size: u64,
        expected_checksum: String,
        chunk_size: u64,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            filename,
            declared_size,
            expected_checksum,
            chunk_size,
            total_chunks: total_chunks(declared_size, chunk_size),
            received_chunks: BTreeSet::new(),
            status: SessionStatus::InProgress,
            created_at: now,
            expires_at: now + ttl,
            finished_at: None,
            version: 0,
        }
    }

    /// Check if session has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() as u64 == self.total_chunks
    }

    /// Indices of chunks that still need to be uploaded, ascending
    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    /// Byte offset at which chunk `index` starts
    pub fn chunk_offset(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Exact byte length chunk `index` must have
    pub fn expected_chunk_len(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.declared_size - self.chunk_size * (self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }

    pub fn chunks_uploaded(&self) -> u64 {
        self.received_chunks.len() as u64
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            upload_id: self.id.to_string(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            expires_at: self.expires_at,
        }
    }

    pub fn ack(&self, chunk_index: u64, is_duplicate: bool) -> ChunkAck {
        ChunkAck {
            upload_id: self.id.to_string(),
            chunk_index,
            chunks_uploaded: self.chunks_uploaded(),
            total_chunks: self.total_chunks,
            is_duplicate,
        }
    }

    pub fn status_result(&self) -> StatusResult {
        StatusResult {
            upload_id: self.id.to_string(),
            status: self.status,
            chunks_uploaded: self.chunks_uploaded(),
            total_chunks: self.total_chunks,
            missing_chunks: self.missing_chunks(),
            expires_at: self.expires_at,
        }
    }
}

/// Session status. COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepting chunks
    InProgress,
    /// File merged and moved to storage
    Completed,
    /// Expired or corrupt; staging data discarded
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            Self::InProgress => false,
            Self::Completed | Self::Failed => true,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Malformed or out-of-range input; the caller must fix the request
    #[error("{0}")]
    InvalidArgument(String),

    /// Operation not valid in the session's current state
    #[error("{0}")]
    InvalidState(String),

    #[error("Invalid upload ID: {0}")]
    SessionNotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Job notification failed: {0}")]
    DependencyError(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DependencyError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::DependencyError(_) => "DEPENDENCY_ERROR",
        }
    }
}
