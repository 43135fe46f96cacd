//! Ingest service binary.
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/ingest.toml, /etc/ndt/ingest.toml)
//! 2. Environment variables (prefixed with INGEST__)

use anyhow::{Context, Result};
use ndt_ingest::api::{start_api_server, AppState};
use ndt_ingest::config::LoggingConfig;
use ndt_ingest::{ImageNormalizer, IngestConfig, IngestionService};
use ndt_pipeline::{KafkaBroker, S3ObjectStore};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = IngestConfig::load().context("Failed to load configuration")?;

    init_logging(&config.logging)?;

    info!(
        service = "ndt-ingest",
        version = env!("CARGO_PKG_VERSION"),
        "Starting ingest service"
    );

    config.validate()?;

    if config.server.enable_metrics {
        init_metrics(config.server.metrics_port)?;
    }

    let store = Arc::new(S3ObjectStore::new(&config.s3).await);
    let broker = Arc::new(
        KafkaBroker::new(config.kafka.clone()).context("Failed to initialize Kafka broker")?,
    );

    let service = IngestionService::new(
        store,
        broker,
        ImageNormalizer::new(
            config.processing.target_width,
            config.processing.target_height,
        ),
        config.kafka.queues.file_processing.clone(),
    );

    let shutdown = CancellationToken::new();
    let api_handle = tokio::spawn({
        let state = AppState {
            service: Arc::new(service),
        };
        let server_config = config.server.clone();
        let max_upload_bytes = config.processing.max_upload_bytes;
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = start_api_server(state, &server_config, max_upload_bytes, shutdown).await {
                error!(error = %e, "API server error");
            }
        }
    });

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");
    shutdown.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task panicked");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("ndt_ingest={}", level).parse()?)
        .add_directive(format!("ndt_pipeline={}", level).parse()?)
        .add_directive("rdkafka=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.format == "json" {
        subscriber.with(layer.json()).init();
    } else {
        subscriber.with(layer.pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
