use crate::config::Config;
use crate::feature_store::{FeatureStore, HistoryRow, HISTORY_LIMIT};
use crate::pipeline::{UploadError, UploadPipeline, UploadRequest};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub feature_store: Arc<FeatureStore>,
}

/// Successful upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    pub label: String,
    pub features: Map<String, Value>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &Config) -> Router {
    let cors = if config.server.cors_enabled {
        if config.server.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .server
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/upload", post(upload_image))
        .route("/history", get(list_history))
        .nest_service("/uploads", ServeDir::new(&config.uploads.dir))
        .fallback_service(ServeDir::new(&config.server.frontend_dir))
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "binsight-gateway"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match sqlx::query("SELECT 1")
        .fetch_one(state.feature_store.pool())
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Upload an image, classify it, and persist the result
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ErrorBody>)> {
    let request = read_upload_form(multipart).await.map_err(reject)?;

    let outcome = state
        .pipeline
        .handle_upload(request)
        .await
        .map_err(reject)?;

    Ok(Json(UploadResponse {
        success: true,
        image_url: outcome.image_url,
        label: outcome.label,
        features: outcome.features,
    }))
}

/// List recent upload history, newest first
#[instrument(skip(state))]
async fn list_history(
    State(state): State<AppState>,
) -> Result<Json<Vec<HistoryRow>>, (StatusCode, Json<ErrorBody>)> {
    let rows = state
        .feature_store
        .list_history(HISTORY_LIMIT)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to read upload history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    success: false,
                    error: "Failed to read upload history".to_string(),
                }),
            )
        })?;

    metrics::counter!("gateway.history.reads").increment(1);

    Ok(Json(rows))
}

/// Parse the multipart upload form.
///
/// Field `image` is required; `annotation`, `location`, and `date` are
/// optional. An unparseable `date` falls back to the request time.
async fn read_upload_form(mut multipart: Multipart) -> Result<UploadRequest, UploadError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut annotation = None;
    let mut location = None;
    let mut captured_at = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidForm(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "image" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| UploadError::InvalidForm(e.to_string()))?;
                file = Some((file_name, bytes.to_vec()));
            }
            "annotation" => {
                annotation = read_text_field(field).await?;
            }
            "location" => {
                location = read_text_field(field).await?;
            }
            "date" => {
                if let Some(raw) = read_text_field(field).await? {
                    captured_at = parse_client_date(&raw);
                }
            }
            _ => {}
        }
    }

    let (file_name, bytes) = file.ok_or(UploadError::MissingFile)?;

    Ok(UploadRequest {
        file_name,
        bytes,
        annotation,
        location,
        captured_at,
    })
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<Option<String>, UploadError> {
    let text = field
        .text()
        .await
        .map_err(|e| UploadError::InvalidForm(e.to_string()))?;

    Ok(Some(text).filter(|t| !t.is_empty()))
}

/// Parse a client-supplied ISO timestamp; None when unparseable
fn parse_client_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Map an upload error to its response status
fn error_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::MissingFile | UploadError::InvalidForm(_) => StatusCode::BAD_REQUEST,
        UploadError::Classification(_) => StatusCode::BAD_GATEWAY,
        UploadError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: UploadError) -> (StatusCode, Json<ErrorBody>) {
    let status = error_status(&err);

    if status == StatusCode::BAD_REQUEST {
        warn!(error = %err, "Upload rejected");
    } else {
        error!(error = %err, "Upload failed");
    }

    metrics::counter!("gateway.uploads.rejected").increment(1);

    (
        status,
        Json(ErrorBody {
            success: false,
            error: err.to_string(),
        }),
    )
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &Config) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    info!(address = %addr, "Starting upload gateway API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifyError;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_parse_client_date() {
        let parsed = parse_client_date("2024-03-02T08:00:00Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap());

        assert!(parse_client_date("yesterday").is_none());
        assert!(parse_client_date("").is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&UploadError::MissingFile), StatusCode::BAD_REQUEST);
        assert_eq!(
            error_status(&UploadError::InvalidForm("truncated".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&UploadError::Classification(ClassifyError::Timeout(
                Duration::from_secs(30)
            ))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&UploadError::Classification(ClassifyError::Upstream {
                status: 500
            })),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&UploadError::Store(anyhow::anyhow!("disk full"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upload_response_shape() {
        let mut features = Map::new();
        features.insert("size_kb".to_string(), serde_json::json!(12.4));

        let response = UploadResponse {
            success: true,
            image_url: "/uploads/1-bin.jpg".to_string(),
            label: "plastic".to_string(),
            features,
        };

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["success"], serde_json::json!(true));
        assert_eq!(body["imageUrl"], serde_json::json!("/uploads/1-bin.jpg"));
        assert_eq!(body["features"]["size_kb"], serde_json::json!(12.4));
    }

    #[test]
    fn test_error_body_shape() {
        let (status, Json(body)) = reject(UploadError::MissingFile);

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = serde_json::to_value(&body).unwrap();
        assert_eq!(body["success"], serde_json::json!(false));
        assert_eq!(body["error"], serde_json::json!("no file uploaded"));
    }

    #[test]
    fn test_history_row_shape() {
        let row = HistoryRow {
            path: "/uploads/1-bin.jpg".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap(),
            annotation: None,
            location: Some("depot nord".to_string()),
            label: "vide".to_string(),
        };

        let body = serde_json::to_value(&row).unwrap();
        assert_eq!(body["path"], serde_json::json!("/uploads/1-bin.jpg"));
        assert_eq!(body["label"], serde_json::json!("vide"));
        assert!(body["annotation"].is_null());
    }
}
