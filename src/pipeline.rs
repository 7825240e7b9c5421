use crate::blob_store::{BlobStore, StoredBlob};
use crate::classifier::{Classification, ClassifierClient, ClassifyError};
use crate::feature_store::{FeatureStore, HistoryEntry, ImageFeatures};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Errors that abort an upload request
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no file uploaded")]
    MissingFile,

    #[error("invalid upload form: {0}")]
    InvalidForm(String),

    #[error("failed to store uploaded image: {0}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Classification(#[from] ClassifyError),
}

/// One parsed upload request
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Original file name from the multipart field
    pub file_name: String,
    /// Raw image bytes
    pub bytes: Vec<u8>,
    /// Optional client-supplied annotation
    pub annotation: Option<String>,
    /// Optional client-supplied location
    pub location: Option<String>,
    /// Optional client-supplied capture time; request time when absent
    pub captured_at: Option<DateTime<Utc>>,
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Stable reference path of the stored blob
    pub image_url: String,
    /// Label assigned by the classifier
    pub label: String,
    /// Feature object as returned by the classifier
    pub features: Map<String, Value>,
}

/// Orchestrator for the upload-classify-persist flow.
///
/// Sequencing within one request: blob write, then classification, then the
/// feature insert, then the history insert. Classification failures abort the
/// request; persistence failures are logged and absorbed.
pub struct UploadPipeline {
    blob_store: Arc<BlobStore>,
    classifier: Arc<ClassifierClient>,
    feature_store: Arc<FeatureStore>,
}

impl UploadPipeline {
    /// Create a new upload pipeline over its collaborators
    pub fn new(
        blob_store: Arc<BlobStore>,
        classifier: Arc<ClassifierClient>,
        feature_store: Arc<FeatureStore>,
    ) -> Self {
        Self {
            blob_store,
            classifier,
            feature_store,
        }
    }

    /// Run one upload through the pipeline
    #[instrument(
        skip(self, request),
        fields(file_name = %request.file_name, size_bytes = request.bytes.len())
    )]
    pub async fn handle_upload(&self, request: UploadRequest) -> Result<UploadOutcome, UploadError> {
        let blob = self
            .blob_store
            .store(&request.file_name, &request.bytes)
            .await
            .map_err(UploadError::Store)?;

        // One attempt, request-blocking. The stored blob is kept on failure.
        let classification = match self.classifier.classify(&blob).await {
            Ok(classification) => classification,
            Err(e) => {
                metrics::counter!("gateway.classify.failures").increment(1);
                return Err(e.into());
            }
        };

        info!(key = %blob.key, label = %classification.label, "Image classified");

        self.persist(&blob, &classification, &request).await;

        metrics::counter!("gateway.uploads.accepted").increment(1);

        Ok(UploadOutcome {
            image_url: blob.url_path.clone(),
            label: classification.label,
            features: classification.features,
        })
    }

    /// Write the feature row and the history row as two independent statements.
    ///
    /// Neither failure reaches the client: the response is built from the
    /// classification result already in hand. A failed feature insert leaves
    /// the history entry with a null image reference; the history insert is
    /// attempted regardless.
    async fn persist(
        &self,
        blob: &StoredBlob,
        classification: &Classification,
        request: &UploadRequest,
    ) {
        let features = ImageFeatures::from_classifier(&blob.url_path, &classification.features);

        let image_id = match self.feature_store.insert_features(&features).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(
                    error = %e,
                    path = %blob.url_path,
                    "Feature insert failed, history will carry a null image reference"
                );
                metrics::counter!("gateway.persistence.absorbed_failures").increment(1);
                None
            }
        };

        let entry = build_history_entry(&blob.url_path, &classification.label, image_id, request);

        if let Err(e) = self.feature_store.insert_history(&entry).await {
            error!(error = %e, path = %blob.url_path, "History insert failed");
            metrics::counter!("gateway.persistence.absorbed_failures").increment(1);
        }
    }
}

/// Assemble a history entry for one classified upload
fn build_history_entry(
    path: &str,
    label: &str,
    image_id: Option<Uuid>,
    request: &UploadRequest,
) -> HistoryEntry {
    HistoryEntry {
        id: Uuid::new_v4(),
        image_id,
        path: path.to_string(),
        label: label.to_string(),
        annotation: request.annotation.clone(),
        location: request.location.clone(),
        created_at: request.captured_at.unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_request(captured_at: Option<DateTime<Utc>>) -> UploadRequest {
        UploadRequest {
            file_name: "bin.jpg".to_string(),
            bytes: vec![0u8; 16],
            annotation: Some("overflowing".to_string()),
            location: Some("depot nord".to_string()),
            captured_at,
        }
    }

    #[test]
    fn test_history_entry_uses_client_capture_time() {
        let captured = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();
        let request = test_request(Some(captured));

        let entry = build_history_entry("/uploads/1-bin.jpg", "pleine", None, &request);

        assert_eq!(entry.created_at, captured);
        assert_eq!(entry.label, "pleine");
        assert_eq!(entry.annotation.as_deref(), Some("overflowing"));
        assert!(entry.image_id.is_none());
    }

    #[test]
    fn test_history_entry_defaults_to_request_time() {
        let before = Utc::now();
        let entry = build_history_entry("/uploads/1-bin.jpg", "vide", None, &test_request(None));
        let after = Utc::now();

        assert!(entry.created_at >= before && entry.created_at <= after);
    }

    #[test]
    fn test_history_entry_carries_feature_reference() {
        let image_id = Uuid::new_v4();
        let entry = build_history_entry(
            "/uploads/1-bin.jpg",
            "pleine",
            Some(image_id),
            &test_request(None),
        );

        assert_eq!(entry.image_id, Some(image_id));
        assert_eq!(entry.path, "/uploads/1-bin.jpg");
    }
}
