//! HTTP contract tests for the upload endpoints

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use chunked_upload_server::config::Config;
use chunked_upload_server::jobs::LogJobNotifier;
use chunked_upload_server::routes;
use chunked_upload_server::state::AppState;
use chunked_upload_server::upload::{compute_hash, ChunkStore, SessionManager, SessionSettings};

const CHUNK_SIZE: u64 = 8;

struct TestApp {
    app: Router,
    temp: TempDir,
}

impl TestApp {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.upload.temp_dir = temp.path().join("tmp");
        config.upload.storage_dir = temp.path().join("storage");
        config.upload.chunk_size = CHUNK_SIZE;

        let sessions = SessionManager::new(
            ChunkStore::new(&config.upload.temp_dir, &config.upload.storage_dir),
            Arc::new(LogJobNotifier),
            SessionSettings {
                chunk_size: CHUNK_SIZE,
                ..SessionSettings::default()
            },
        );

        let app = routes::app(AppState::new(sessions));
        Self { app, temp }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn post(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn upload(&self, upload_id: &str, index: i64, data: &[u8]) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/upload/{}/{}", upload_id, index))
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(data.to_vec()))
                .unwrap(),
        )
        .await
    }

    async fn initiate(&self, filename: &str, size: u64, checksum: &str) -> String {
        let (status, body) = self
            .post(&format!(
                "/initiate?filename={}&fileSize={}&checksum={}",
                filename, size, checksum
            ))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["uploadId"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_full_upload_flow() {
    let app = TestApp::new();
    let content = b"0123456789abcdefXYZ";
    let checksum = compute_hash(content);

    let (status, body) = app
        .post(&format!(
            "/initiate?filename=clip.mp4&fileSize={}&checksum={}",
            content.len(),
            checksum
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chunkSize"], 8);
    assert_eq!(body["totalChunks"], 3);
    assert!(body["expiresAt"].is_string());
    let upload_id = body["uploadId"].as_str().unwrap().to_string();

    // Out of order
    let (status, body) = app.upload(&upload_id, 2, &content[16..]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chunksUploaded"], 1);
    assert_eq!(body["isDuplicate"], false);

    let (status, body) = app.get(&format!("/status/{}", upload_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "IN_PROGRESS");
    assert_eq!(body["missingChunks"], serde_json::json!([0, 1]));

    app.upload(&upload_id, 0, &content[..8]).await;
    let (_, body) = app.upload(&upload_id, 1, &content[8..16]).await;
    assert_eq!(body["chunksUploaded"], 3);
    assert_eq!(body["totalChunks"], 3);

    // Retry after a lost ack
    let (status, body) = app.upload(&upload_id, 1, &content[8..16]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isDuplicate"], true);
    assert_eq!(body["chunksUploaded"], 3);

    let (status, body) = app
        .post(&format!("/complete/{}?checksum={}", upload_id, checksum))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["uploadId"], upload_id.as_str());
    assert_eq!(body["filename"], "clip.mp4");
    assert_eq!(body["fileSize"], 19);
    assert_eq!(body["sha256"], checksum.as_str());

    let stored = app.temp.path().join("storage").join("clip.mp4");
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), content);
    assert!(!app.temp.path().join("tmp").join(&upload_id).exists());

    // Completed sessions answer with a conflict
    let (status, body) = app.get(&format!("/status/{}", upload_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (status, _) = app.upload(&upload_id, 0, &content[..8]).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app.post(&format!("/complete/{}", upload_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_initiate_validation() {
    let app = TestApp::new();

    let (status, body) = app.post("/initiate?filename=a.bin&fileSize=0&checksum=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");

    let (status, _) = app.post("/initiate?filename=a.bin&fileSize=-5&checksum=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.post("/initiate?filename=..&fileSize=10&checksum=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.post("/initiate?filename=a.bin").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .post(&format!(
            "/initiate?filename=a.bin&fileSize={}&checksum=x",
            i64::MAX
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_traversal_filename_stays_in_storage() {
    let app = TestApp::new();
    let upload_id = app.initiate("..%2F..%2Fescape.txt", 4, "x").await;

    app.upload(&upload_id, 0, b"data").await;
    let (status, body) = app.post(&format!("/complete/{}", upload_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filename"], "escape.txt");
    assert!(app.temp.path().join("storage").join("escape.txt").exists());
    assert!(!app.temp.path().join("escape.txt").exists());
}

#[tokio::test]
async fn test_chunk_validation() {
    let app = TestApp::new();
    let upload_id = app.initiate("a.bin", 20, "x").await;

    let (status, body) = app.upload(&upload_id, 5, b"01234567").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid chunk index");

    let (status, _) = app.upload(&upload_id, -1, b"01234567").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.upload(&upload_id, 0, b"0123").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid chunk size");

    let (status, body) = app
        .upload(&uuid::Uuid::new_v4().to_string(), 0, b"01234567")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_content_range_header() {
    let app = TestApp::new();
    let upload_id = app.initiate("a.bin", 12, "x").await;

    let request = |range: &str, index: u64, data: &'static [u8]| {
        Request::builder()
            .method(Method::POST)
            .uri(format!("/upload/{}/{}", upload_id, index))
            .header(header::CONTENT_RANGE, range)
            .body(Body::from(data))
            .unwrap()
    };

    let (status, _) = app.send(request("bytes 8-11/12", 1, b"89ab")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.send(request("bytes 8-15/12", 0, b"01234567")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.send(request("garbage", 0, b"01234567")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid Content-Range header");

    let (status, body) = app
        .send(request("bytes 0-18446744073709551615/12", 0, b"01234567"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid Content-Range header");
}

#[tokio::test]
async fn test_complete_before_all_chunks() {
    let app = TestApp::new();
    let upload_id = app.initiate("a.bin", 20, "x").await;

    app.upload(&upload_id, 0, b"01234567").await;
    app.upload(&upload_id, 1, b"89abcdef").await;

    let (status, body) = app.post(&format!("/complete/{}", upload_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Not all chunks received");
}

#[tokio::test]
async fn test_checksum_mismatch() {
    let app = TestApp::new();
    let upload_id = app.initiate("a.bin", 4, "expected").await;
    app.upload(&upload_id, 0, b"data").await;

    let (status, body) = app
        .post(&format!("/complete/{}?checksum=different", upload_id))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Checksum mismatch");

    let (_, body) = app.get(&format!("/status/{}", upload_id)).await;
    assert_eq!(body["status"], "IN_PROGRESS");
}

#[tokio::test]
async fn test_storage_failure_is_generic_500() {
    let app = TestApp::new();
    let upload_id = app.initiate("a.bin", 4, "x").await;
    app.upload(&upload_id, 0, b"data").await;

    // Pull the staged chunk out from under the session
    let chunk = app.temp.path().join("tmp").join(&upload_id).join("chunk_0");
    tokio::fs::remove_file(&chunk).await.unwrap();

    let (status, body) = app.post(&format!("/complete/{}", upload_id)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Upload failed");
    assert!(!body.to_string().contains("chunk_0"));

    let (_, body) = app.get(&format!("/status/{}", upload_id)).await;
    assert_eq!(body["status"], "IN_PROGRESS");
}
