use crate::blob_store::StoredBlob;
use crate::config::ClassifierConfig;
use anyhow::{Context, Result};
use reqwest::multipart;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by one classification attempt.
///
/// Every variant fails the upload request end-to-end; there are no retries.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier request timed out after {0:?}")]
    Timeout(Duration),

    #[error("classifier responded with status {status}")]
    Upstream { status: u16 },

    #[error("classifier response is not valid JSON: {0}")]
    InvalidBody(#[source] reqwest::Error),

    #[error("classifier response is missing a label")]
    MissingLabel,

    #[error("failed to read stored image: {0}")]
    ReadBlob(#[from] std::io::Error),

    #[error("classifier request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Result of one classification call
#[derive(Debug, Clone)]
pub struct Classification {
    /// Label assigned by the classifier, never empty
    pub label: String,
    /// Feature object as returned by the classifier; shape is owned by the
    /// classifier and may be partial or empty
    pub features: Map<String, Value>,
}

impl Classification {
    /// Parse a classifier response body. A missing or empty `label` is an
    /// error; a missing `features` object is an empty map.
    fn from_response(body: Value) -> Result<Self, ClassifyError> {
        let label = body
            .get("label")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .ok_or(ClassifyError::MissingLabel)?
            .to_string();

        let features = body
            .get("features")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(Self { label, features })
    }
}

/// HTTP client for the external classification service
pub struct ClassifierClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ClassifierClient {
    /// Create a new classifier client
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            base_url = %config.base_url(),
            timeout_secs = config.timeout_secs,
            "Classifier client initialized"
        );

        Ok(Self {
            http,
            base_url: config.base_url(),
            timeout: config.classify_timeout(),
        })
    }

    /// Send a stored image to the classifier and return its label and features.
    ///
    /// The bytes are read back from the blob store, so the classifier always
    /// sees exactly what was durably written. At most one attempt per call.
    #[instrument(skip(self, blob), fields(key = %blob.key))]
    pub async fn classify(&self, blob: &StoredBlob) -> Result<Classification, ClassifyError> {
        let bytes = tokio::fs::read(&blob.disk_path).await?;

        let part = multipart::Part::bytes(bytes).file_name(blob.key.clone());
        let form = multipart::Form::new().part("image", part);

        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/classify", self.base_url))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifyError::Timeout(self.timeout)
                } else {
                    ClassifyError::Transport(e)
                }
            })?;

        metrics::histogram!("gateway.classify.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifyError::Upstream {
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(ClassifyError::InvalidBody)?;
        let classification = Classification::from_response(body)?;

        debug!(label = %classification.label, "Classification received");

        Ok(classification)
    }
}
