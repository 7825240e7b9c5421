use anyhow::{Context, Result};
use binsight_gateway::api::{start_api_server, AppState};
use binsight_gateway::blob_store::BlobStore;
use binsight_gateway::classifier::ClassifierClient;
use binsight_gateway::config::Config;
use binsight_gateway::feature_store::FeatureStore;
use binsight_gateway::pipeline::UploadPipeline;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Binsight upload gateway"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let feature_store = Arc::new(
        FeatureStore::new(&config.database)
            .await
            .context("Failed to initialize feature store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        feature_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        BlobStore::new(&config.uploads.dir)
            .await
            .context("Failed to initialize blob store")?,
    );

    let classifier = Arc::new(
        ClassifierClient::new(&config.classifier)
            .context("Failed to initialize classifier client")?,
    );

    let pipeline = Arc::new(UploadPipeline::new(
        blob_store,
        classifier,
        feature_store.clone(),
    ));

    // Create API state
    let state = AppState {
        pipeline,
        feature_store,
    };

    // Spawn API server task
    let api_config = config.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Upload gateway started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down upload gateway");

    api_handle.abort();

    info!("Upload gateway stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
