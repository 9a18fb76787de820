//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /initiate - Create an upload session
//! - POST /upload/:upload_id/:chunk_index - Upload a chunk (raw body)
//! - POST /complete/:upload_id - Merge chunks and store the file
//! - GET /status/:upload_id - Get upload progress

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ChunkAck, CompleteRequest, CompletionResult, ContentRange, InitiateRequest, SessionDescriptor,
    StatusResult, UploadError,
};

/// Headroom over the chunk size before a body is refused outright
const BODY_LIMIT_SLACK: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Server-side failures are logged, never echoed
        let error = if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
            "Upload failed".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router. Chunk bodies may be up to `chunk_size` bytes.
pub fn router(chunk_size: u64) -> Router<AppState> {
    let body_limit = usize::try_from(chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/initiate", post(initiate))
        .route(
            "/upload/:upload_id/:chunk_index",
            post(upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/complete/:upload_id", post(complete))
        .route("/status/:upload_id", get(status))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /initiate?filename=..&fileSize=..&checksum=..
async fn initiate(
    State(state): State<AppState>,
    query: Result<Query<InitiateRequest>, QueryRejection>,
) -> Result<Json<SessionDescriptor>, UploadError> {
    let Query(request) = query.map_err(|e| UploadError::InvalidArgument(e.body_text()))?;

    let descriptor = state
        .sessions()
        .initiate(&request.filename, request.file_size, &request.checksum)
        .await?;

    Ok(Json(descriptor))
}

/// POST /upload/:upload_id/:chunk_index
///
/// The chunk is the raw request body. An optional `Content-Range` header
/// must describe exactly this chunk.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkAck>, UploadError> {
    // Parsed as signed so a negative index is a validation error, not a 404
    let chunk_index: i64 = chunk_index
        .parse()
        .map_err(|_| UploadError::InvalidArgument("Invalid chunk index".to_string()))?;

    let declared_range = match headers.get(header::CONTENT_RANGE) {
        None => None,
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(ContentRange::parse)
                .ok_or_else(|| UploadError::InvalidArgument("Invalid Content-Range header".to_string()))?,
        ),
    };

    let ack = state
        .sessions()
        .submit_chunk(&upload_id, chunk_index, &body, declared_range)
        .await?;

    Ok(Json(ack))
}

/// POST /complete/:upload_id?checksum=..
async fn complete(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    query: Result<Query<CompleteRequest>, QueryRejection>,
) -> Result<Json<CompletionResult>, UploadError> {
    let Query(request) = query.map_err(|e| UploadError::InvalidArgument(e.body_text()))?;

    let result = state
        .sessions()
        .complete(&upload_id, request.checksum.as_deref())
        .await?;

    Ok(Json(result))
}

/// GET /status/:upload_id
async fn status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResult>, UploadError> {
    let status = state.sessions().status(&upload_id).await?;
    Ok(Json(status))
}
