use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Local-filesystem blob store for uploaded images
pub struct BlobStore {
    root: PathBuf,
}

/// A durably stored upload blob
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Generated storage key (file name under the upload directory)
    pub key: String,
    /// Stable reference path served back to clients (`/uploads/{key}`)
    pub url_path: String,
    /// Absolute or working-directory-relative path on disk
    pub disk_path: PathBuf,
    /// Size of the stored bytes
    pub size_bytes: u64,
}

impl BlobStore {
    /// Create a new blob store, preparing the upload directory
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create upload directory {}", root.display()))?;

        info!(dir = %root.display(), "Blob store initialized");

        Ok(Self { root })
    }

    /// Write uploaded bytes under a collision-resistant key
    pub async fn store(&self, original_name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        let key = blob_key(original_name, Utc::now());
        let disk_path = self.root.join(&key);

        tokio::fs::write(&disk_path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", disk_path.display()))?;

        debug!(key = %key, size_bytes = bytes.len(), "Blob stored");

        Ok(StoredBlob {
            url_path: format!("/uploads/{}", key),
            key,
            disk_path,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Generate a storage key for an upload.
/// Format: `{millis}-{sanitized original name}`.
///
/// The millisecond timestamp component keeps concurrent uploads of the same
/// file name from colliding in the shared upload directory.
fn blob_key(original_name: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        timestamp.timestamp_millis(),
        sanitize_file_name(original_name)
    )
}

/// Sanitize an uploaded file name to prevent path traversal
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_blob_key_format() {
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let key = blob_key("bin.jpg", timestamp);

        assert_eq!(key, format!("{}-bin.jpg", timestamp.timestamp_millis()));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("bin-01.jpg"), "bin-01.jpg");
        assert_eq!(sanitize_file_name("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_file_name("photo du bac.png"), "photo_du_bac.png");
        assert_eq!(sanitize_file_name("..."), "upload");
        assert_eq!(sanitize_file_name(""), "upload");
    }

    #[test]
    fn test_store_writes_blob() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = BlobStore::new(dir.path()).await.unwrap();

            let blob = store.store("bin.jpg", b"not really a jpeg").await.unwrap();

            assert!(blob.url_path.starts_with("/uploads/"));
            assert!(blob.key.ends_with("-bin.jpg"));
            assert_eq!(blob.size_bytes, 17);

            let on_disk = tokio::fs::read(&blob.disk_path).await.unwrap();
            assert_eq!(on_disk, b"not really a jpeg");
        });
    }

    #[test]
    fn test_new_creates_missing_directory() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let nested = dir.path().join("uploads").join("blobs");

            let store = BlobStore::new(&nested).await.unwrap();

            assert!(store.root().is_dir());
        });
    }
}
