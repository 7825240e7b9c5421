//! Binsight Upload Gateway
//!
//! HTTP gateway for the Binsight waste monitoring platform. Accepts image
//! uploads, stores the bytes in a local blob directory, forwards them to the
//! external classification service, indexes the resulting features and the
//! upload history in PostgreSQL, and serves the history back to the dashboard.
//!
//! ## Features
//!
//! - **Collision-resistant blob storage**: uploads land under
//!   `{timestamp}-{original-name}` keys in a shared upload directory
//! - **Bounded classification calls**: one attempt per upload with a
//!   configurable timeout; upstream failures fail the request with 502
//! - **Partial-failure isolation**: database writes after a successful
//!   classification are logged-and-absorbed, never surfaced to the client
//! - **History listing**: newest-first, capped at 100 entries
//!
//! ## Architecture
//!
//! ```text
//! POST /upload               uploads/                 PostgreSQL
//! ┌──────────────┐          ┌────────────────┐       ┌────────────────┐
//! │ Upload       │─────────▶│ Blob Store     │       │ image_features │
//! │ Pipeline     │          │ {ts}-{name}    │       │ upload_history │
//! └──────────────┘          └────────────────┘       └────────────────┘
//!        │                                                   ▲
//!        ▼                                                   │
//! ┌──────────────┐          ┌────────────────┐               │
//! │ Classifier   │─────────▶│ POST /classify │               │
//! │ Client       │          │ (external)     │               │
//! └──────────────┘          └────────────────┘               │
//!        │                                                   │
//!        └───────────────▶ Feature Store ───────────────────┘
//!                                 │
//!                                 ▼
//!                          GET /history
//! ```

pub mod api;
pub mod blob_store;
pub mod classifier;
pub mod config;
pub mod feature_store;
pub mod pipeline;

pub use blob_store::{BlobStore, StoredBlob};
pub use classifier::{Classification, ClassifierClient, ClassifyError};
pub use config::Config;
pub use feature_store::{FeatureStore, HistoryEntry, HistoryRow, ImageFeatures, HISTORY_LIMIT};
pub use pipeline::{UploadError, UploadOutcome, UploadPipeline, UploadRequest};
