use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Hard cap on history listing size
pub const HISTORY_LIMIT: i64 = 100;

/// Numeric projection of one upload, persisted to the feature table.
///
/// Every numeric column is optional: the classifier owns the features object
/// and may return any subset of the expected fields.
#[derive(Debug, Clone)]
pub struct ImageFeatures {
    /// Stable reference path of the stored blob
    pub path: String,
    /// File size in kilobytes, rounded to the nearest integer
    pub file_size_kb: Option<i32>,
    /// Image width in pixels
    pub width: Option<i32>,
    /// Image height in pixels
    pub height: Option<i32>,
    /// Mean red channel value
    pub mean_r: Option<f64>,
    /// Mean green channel value
    pub mean_g: Option<f64>,
    /// Mean blue channel value
    pub mean_b: Option<f64>,
}

impl ImageFeatures {
    /// Project the classifier's features object onto the feature-table columns.
    ///
    /// `size_kb` is rounded to the nearest integer before storage; the rounding
    /// is lossy and one-way. Missing or non-numeric fields become NULLs.
    pub fn from_classifier(path: &str, features: &Map<String, Value>) -> Self {
        Self {
            path: path.to_string(),
            file_size_kb: numeric(features, "size_kb").map(|v| v.round() as i32),
            width: numeric(features, "width").map(|v| v.round() as i32),
            height: numeric(features, "height").map(|v| v.round() as i32),
            mean_r: numeric(features, "avg_r"),
            mean_g: numeric(features, "avg_g"),
            mean_b: numeric(features, "avg_b"),
        }
    }
}

fn numeric(features: &Map<String, Value>, key: &str) -> Option<f64> {
    features.get(key).and_then(Value::as_f64)
}

/// One completed upload event, written after classification succeeded
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Generated entry ID
    pub id: Uuid,
    /// Feature row reference; None when the feature insert failed
    pub image_id: Option<Uuid>,
    /// Stable reference path of the stored blob
    pub path: String,
    /// Label assigned by the classifier
    pub label: String,
    /// Optional client-supplied annotation
    pub annotation: Option<String>,
    /// Optional client-supplied location
    pub location: Option<String>,
    /// Client-supplied capture time, or the request time
    pub created_at: DateTime<Utc>,
}

/// History entry as returned by the read path
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryRow {
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub annotation: Option<String>,
    pub location: Option<String>,
    pub label: String,
}

/// Persistence gateway for feature and history rows in PostgreSQL
pub struct FeatureStore {
    pool: PgPool,
}

impl FeatureStore {
    /// Create a new feature store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a feature row and return its generated ID
    #[instrument(skip(self, features), fields(path = %features.path))]
    pub async fn insert_features(&self, features: &ImageFeatures) -> Result<Uuid> {
        let image_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO image_features (
                id, path, file_size_kb, width, height,
                mean_r, mean_g, mean_b, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, NOW()
            )
            "#,
        )
        .bind(image_id)
        .bind(&features.path)
        .bind(features.file_size_kb)
        .bind(features.width)
        .bind(features.height)
        .bind(features.mean_r)
        .bind(features.mean_g)
        .bind(features.mean_b)
        .execute(&self.pool)
        .await
        .context("Failed to insert feature row")?;

        debug!(image_id = %image_id, "Feature row inserted");

        metrics::counter!("gateway.features.inserted").increment(1);

        Ok(image_id)
    }

    /// Insert a history entry
    #[instrument(skip(self, entry), fields(path = %entry.path, label = %entry.label))]
    pub async fn insert_history(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_history (
                id, image_id, path, label, annotation, location, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(entry.id)
        .bind(entry.image_id)
        .bind(&entry.path)
        .bind(&entry.label)
        .bind(&entry.annotation)
        .bind(&entry.location)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert history entry")?;

        debug!(entry_id = %entry.id, "History entry inserted");

        metrics::counter!("gateway.history.inserted").increment(1);

        Ok(())
    }

    /// List history entries, most recent first, capped at [`HISTORY_LIMIT`]
    #[instrument(skip(self))]
    pub async fn list_history(&self, limit: i64) -> Result<Vec<HistoryRow>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT path, created_at, annotation, location, label
            FROM upload_history
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(capped_limit(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query upload history")?;

        Ok(rows)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn capped_limit(limit: i64) -> i64 {
    limit.clamp(1, HISTORY_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn features_map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_projection_rounds_size_kb() {
        let features = features_map(json!({
            "size_kb": 12.4,
            "width": 200,
            "height": 100,
            "avg_r": 100.0,
            "avg_g": 90.0,
            "avg_b": 80.0
        }));

        let projected = ImageFeatures::from_classifier("/uploads/1-bin.jpg", &features);

        assert_eq!(projected.file_size_kb, Some(12));
        assert_eq!(projected.width, Some(200));
        assert_eq!(projected.height, Some(100));
        assert_eq!(projected.mean_r, Some(100.0));
        assert_eq!(projected.mean_b, Some(80.0));
    }

    #[test]
    fn test_projection_tolerates_partial_features() {
        let features = features_map(json!({"width": 640}));

        let projected = ImageFeatures::from_classifier("/uploads/2-bin.jpg", &features);

        assert_eq!(projected.width, Some(640));
        assert_eq!(projected.file_size_kb, None);
        assert_eq!(projected.height, None);
        assert_eq!(projected.mean_r, None);
    }

    #[test]
    fn test_projection_ignores_non_numeric_values() {
        let features = features_map(json!({"width": "wide", "size_kb": [1, 2]}));

        let projected = ImageFeatures::from_classifier("/uploads/3-bin.jpg", &features);

        assert_eq!(projected.width, None);
        assert_eq!(projected.file_size_kb, None);
    }

    #[test]
    fn test_capped_limit() {
        assert_eq!(capped_limit(10), 10);
        assert_eq!(capped_limit(100), 100);
        assert_eq!(capped_limit(5000), HISTORY_LIMIT);
        assert_eq!(capped_limit(0), 1);
    }
}
