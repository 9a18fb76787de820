//! Chunk Store
//!
//! On-disk staging for uploaded chunks before assembly, and the move of the
//! merged file into permanent storage.
//!
//! Layout:
//! - `{temp_dir}/{session_id}/chunk_{index}` while uploading
//! - `{temp_dir}/{session_id}/{filename}.part` while merging
//! - `{storage_dir}/{filename}` once relocated

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::types::UploadError;

/// Prefix of staged chunk files
pub const CHUNK_FILE_PREFIX: &str = "chunk_";

/// Suffix of the session-scoped merge output
const MERGE_SUFFIX: &str = ".part";

/// Longest accepted file name, leaving room for `MERGE_SUFFIX`
const MAX_FILENAME_LEN: usize = 250;

/// Output of a successful merge
#[derive(Debug, Clone)]
pub struct MergedFile {
    /// Session-scoped staging path of the merged bytes
    pub path: PathBuf,

    /// Total bytes written
    pub size: u64,

    /// SHA-256 of the merged bytes, hex encoded
    pub sha256: String,
}

// ============================================================================
// Chunk Store
// ============================================================================

/// Local filesystem staging area plus final storage directory
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Root of per-session staging directories
    temp_dir: PathBuf,

    /// Permanent storage for merged files
    storage_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(temp_dir: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                temp_dir: temp_dir.into(),
                storage_dir: storage_dir.into(),
            }),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.inner.storage_dir
    }

    /// Staging directory of one session
    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.inner.temp_dir.join(session_id.to_string())
    }

    /// Staging path of one chunk
    pub fn chunk_path(&self, session_id: Uuid, chunk_index: u64) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}{}", CHUNK_FILE_PREFIX, chunk_index))
    }

    /// Create the empty staging directory for a session
    pub async fn prepare(&self, session_id: Uuid) -> Result<PathBuf, UploadError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::StorageError(format!("Failed to create upload directory: {}", e)))?;
        Ok(dir)
    }

    /// Write a chunk, replacing whatever is stored at `(session_id, chunk_index)`.
    ///
    /// Bytes go to a temporary file that is synced and then renamed over the
    /// chunk path, so readers only ever see a complete chunk. Fails if the
    /// session directory does not exist.
    pub async fn write_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u64,
        data: &[u8],
    ) -> Result<(), UploadError> {
        let chunk_path = self.chunk_path(session_id, chunk_index);
        let tmp_path = self.session_dir(session_id).join(format!(
            ".{}{}.{}.tmp",
            CHUNK_FILE_PREFIX,
            chunk_index,
            Uuid::new_v4().simple()
        ));

        if let Err(e) = write_synced(&tmp_path, data).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(UploadError::StorageError(format!("Failed to save chunk: {}", e)));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &chunk_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(UploadError::StorageError(format!("Failed to save chunk: {}", e)));
        }

        Ok(())
    }

    /// Concatenate chunks `0..total_chunks` in index order into
    /// `{session_dir}/{target_name}.part`.
    ///
    /// A missing chunk file aborts the merge; partial output is removed.
    pub async fn merge_in_order(
        &self,
        session_id: Uuid,
        total_chunks: u64,
        target_name: &str,
    ) -> Result<MergedFile, UploadError> {
        let target_name = sanitize_filename(target_name)?;
        let output_path = self
            .session_dir(session_id)
            .join(format!("{}{}", target_name, MERGE_SUFFIX));

        match self.concat_chunks(session_id, total_chunks, &output_path).await {
            Ok((size, sha256)) => Ok(MergedFile {
                path: output_path,
                size,
                sha256,
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&output_path).await;
                Err(e)
            }
        }
    }

    async fn concat_chunks(
        &self,
        session_id: Uuid,
        total_chunks: u64,
        output_path: &Path,
    ) -> Result<(u64, String), UploadError> {
        let file = tokio::fs::File::create(output_path)
            .await
            .map_err(|e| UploadError::StorageError(format!("Failed to create merge output: {}", e)))?;
        let mut output = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        for index in 0..total_chunks {
            let data = match tokio::fs::read(self.chunk_path(session_id, index)).await {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(UploadError::StorageError(format!(
                        "Chunk {} missing from staging",
                        index
                    )));
                }
                Err(e) => {
                    return Err(UploadError::StorageError(format!(
                        "Failed to read chunk {}: {}",
                        index, e
                    )));
                }
            };

            hasher.update(&data);
            output
                .write_all(&data)
                .await
                .map_err(|e| UploadError::StorageError(format!("Failed to write merge output: {}", e)))?;
            size += data.len() as u64;
        }

        output
            .flush()
            .await
            .map_err(|e| UploadError::StorageError(format!("Failed to flush merge output: {}", e)))?;
        output
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| UploadError::StorageError(format!("Failed to sync merge output: {}", e)))?;

        Ok((size, hex::encode(hasher.finalize())))
    }

    /// Move a merged file to `{storage_dir}/{final_name}`, overwriting any
    /// existing file of that name.
    pub async fn relocate(&self, staged: &Path, final_name: &str) -> Result<PathBuf, UploadError> {
        let final_name = sanitize_filename(final_name)?;
        let target = self.inner.storage_dir.join(final_name);

        tokio::fs::create_dir_all(&self.inner.storage_dir)
            .await
            .map_err(|e| UploadError::StorageError(format!("Failed to create storage directory: {}", e)))?;

        if let Err(rename_err) = tokio::fs::rename(staged, &target).await {
            // Rename cannot cross filesystems; fall back to copy + remove.
            tracing::debug!(
                error = %rename_err,
                target = %target.display(),
                "Rename into storage failed, copying instead"
            );
            copy_into_place(staged, &target)
                .await
                .map_err(|e| UploadError::StorageError(format!("Failed to move file to storage: {}", e)))?;
            if let Err(e) = tokio::fs::remove_file(staged).await {
                tracing::warn!(error = %e, path = %staged.display(), "Failed to remove merged file after copy");
            }
        }

        Ok(target)
    }

    /// Remove the session's staging directory and everything in it.
    ///
    /// Best-effort: failures are logged and skipped. Returns the number of
    /// entries removed.
    pub async fn cleanup(&self, session_id: Uuid) -> usize {
        let session_dir = self.session_dir(session_id);

        let mut entries = match tokio::fs::read_dir(&session_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to list staging directory");
                return 0;
            }
        };

        let mut count = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to read staging entry");
                    break;
                }
            };

            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };

            match removed {
                Ok(()) => count += 1,
                Err(e) => tracing::warn!(
                    session_id = %session_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete staged file"
                ),
            }
        }

        if let Err(e) = tokio::fs::remove_dir(&session_dir).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to remove staging directory");
        }

        count
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Copy `source` to a temporary name beside `target`, then rename it over
/// `target`. A failed copy never leaves a partial file at `target`.
async fn copy_into_place(source: &Path, target: &Path) -> std::io::Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = target.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let copied = async {
        tokio::fs::copy(source, &tmp_path).await?;
        tokio::fs::File::open(&tmp_path).await?.sync_all().await?;
        tokio::fs::rename(&tmp_path, target).await
    }
    .await;

    if copied.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    copied
}

/// Reduce an untrusted file name to a single safe path segment.
///
/// Anything up to the last `/` or `\` is dropped. Empty names, `.`, `..`,
/// control characters and overlong names are rejected.
pub fn sanitize_filename(raw: &str) -> Result<String, UploadError> {
    let name = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::InvalidArgument("Invalid file name".to_string()));
    }
    if name.chars().any(char::is_control) {
        return Err(UploadError::InvalidArgument("Invalid file name".to_string()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(UploadError::InvalidArgument("File name too long".to_string()));
    }

    Ok(name.to_string())
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether `value` looks like a hex SHA-256 digest
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ChunkStore {
        ChunkStore::new(temp.path().join("tmp"), temp.path().join("storage"))
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("video.mp4").unwrap(), "video.mp4");
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\clip.mov").unwrap(), "clip.mov");
        assert_eq!(sanitize_filename("  spaced.mkv ").unwrap(), "spaced.mkv");

        for bad in ["", "   ", ".", "..", "dir/", "a/..", "bad\0name", "new\nline"] {
            assert!(
                matches!(sanitize_filename(bad), Err(UploadError::InvalidArgument(_))),
                "accepted {:?}",
                bad
            );
        }

        let long = "a".repeat(MAX_FILENAME_LEN + 1);
        assert!(sanitize_filename(&long).is_err());
    }

    #[test]
    fn test_is_sha256_hex() {
        assert!(is_sha256_hex(&compute_hash(b"x")));
        assert!(!is_sha256_hex("abc123"));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }

    #[tokio::test]
    async fn test_write_requires_prepared_directory() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();

        let result = store.write_chunk(session_id, 0, b"data").await;
        assert!(matches!(result, Err(UploadError::StorageError(_))));

        store.prepare(session_id).await.unwrap();
        store.write_chunk(session_id, 0, b"data").await.unwrap();
        assert_eq!(tokio::fs::read(store.chunk_path(session_id, 0)).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_write_overwrites_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();
        store.prepare(session_id).await.unwrap();

        store.write_chunk(session_id, 3, b"first attempt").await.unwrap();
        store.write_chunk(session_id, 3, b"second").await.unwrap();

        let data = tokio::fs::read(store.chunk_path(session_id, 3)).await.unwrap();
        assert_eq!(data, b"second");

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(store.session_dir(session_id)).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["chunk_3".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_in_index_order() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();
        store.prepare(session_id).await.unwrap();

        // Written out of order on purpose
        store.write_chunk(session_id, 2, b"!").await.unwrap();
        store.write_chunk(session_id, 0, b"Hello, ").await.unwrap();
        store.write_chunk(session_id, 1, b"World").await.unwrap();

        let merged = store.merge_in_order(session_id, 3, "greeting.txt").await.unwrap();
        assert_eq!(merged.path, store.session_dir(session_id).join("greeting.txt.part"));
        assert_eq!(merged.size, 13);
        assert_eq!(merged.sha256, compute_hash(b"Hello, World!"));
        assert_eq!(tokio::fs::read(&merged.path).await.unwrap(), b"Hello, World!");
    }

    #[tokio::test]
    async fn test_merge_fails_on_missing_chunk() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();
        store.prepare(session_id).await.unwrap();

        store.write_chunk(session_id, 0, b"a").await.unwrap();
        store.write_chunk(session_id, 2, b"c").await.unwrap();

        let result = store.merge_in_order(session_id, 3, "out.bin").await;
        assert!(matches!(result, Err(UploadError::StorageError(_))));
        assert!(!store.session_dir(session_id).join("out.bin.part").exists());
    }

    #[tokio::test]
    async fn test_merge_output_never_clobbers_chunks() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();
        store.prepare(session_id).await.unwrap();

        store.write_chunk(session_id, 0, b"abc").await.unwrap();

        let merged = store.merge_in_order(session_id, 1, "chunk_0").await.unwrap();
        assert_eq!(tokio::fs::read(&merged.path).await.unwrap(), b"abc");
        assert_eq!(tokio::fs::read(store.chunk_path(session_id, 0)).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_relocate_overwrites_existing() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();
        store.prepare(session_id).await.unwrap();

        tokio::fs::create_dir_all(store.storage_dir()).await.unwrap();
        tokio::fs::write(store.storage_dir().join("movie.mp4"), b"old").await.unwrap();

        store.write_chunk(session_id, 0, b"new").await.unwrap();
        let merged = store.merge_in_order(session_id, 1, "movie.mp4").await.unwrap();
        let final_path = store.relocate(&merged.path, "movie.mp4").await.unwrap();

        assert_eq!(final_path, store.storage_dir().join("movie.mp4"));
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"new");
        assert!(!merged.path.exists());
    }

    #[tokio::test]
    async fn test_copy_into_place_replaces_target() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("merged.part");
        let target = temp.path().join("movie.mp4");
        tokio::fs::write(&source, b"new bytes").await.unwrap();
        tokio::fs::write(&target, b"old").await.unwrap();

        copy_into_place(&source, &target).await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"new bytes");
        let mut entries = tokio::fs::read_dir(temp.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        assert_eq!(names, vec!["merged.part".to_string(), "movie.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_nothing_at_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("movie.mp4");

        let result = copy_into_place(&temp.path().join("missing.part"), &target).await;
        assert!(result.is_err());

        let mut entries = tokio::fs::read_dir(temp.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_session_directory() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let session_id = Uuid::new_v4();
        store.prepare(session_id).await.unwrap();

        store.write_chunk(session_id, 0, b"a").await.unwrap();
        store.write_chunk(session_id, 1, b"b").await.unwrap();

        assert_eq!(store.cleanup(session_id).await, 2);
        assert!(!store.session_dir(session_id).exists());

        // Cleaning up twice is harmless
        assert_eq!(store.cleanup(session_id).await, 0);
    }
}
