//! Results service binary.
//!
//! One binary, several roles. Each role can run in its own process; `all`
//! runs every role in this one.
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/results.toml, /etc/ndt/results.toml)
//! 2. Environment variables (prefixed with RESULTS__)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ndt_pipeline::{
    HttpDetector, KafkaBroker, MessageBroker, ObjectStore, RedeliveryPolicy, S3ObjectStore,
};
use results_service::api::{start_api_server, AppState};
use results_service::consumers::spawn_consumer;
use results_service::{
    Config, DetectionResultHandler, DetectionWorker, HealthAggregator, JobStore,
    PostgresJobStore, ProgressBroadcaster, ReportConsumer, ReportGenerator, ResultRecorder,
};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "results-service")]
#[command(about = "Result recording, progress and reporting for the NDT pipeline")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// HTTP API: jobs, result recording, reports, system status
    Serve,
    /// Detection worker on the file-processing queue
    Detect,
    /// Result recorder on the detection-results queue
    ResultsConsumer,
    /// Report generator on the report-generation queue
    Reports,
    /// Every role in one process
    All,
}

impl Role {
    fn runs(self, role: Role) -> bool {
        self == Role::All || self == role
    }
}

/// Everything the roles share
struct Components {
    config: Config,
    store: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
    broker: Arc<dyn MessageBroker>,
    detector: Arc<HttpDetector>,
    progress: ProgressBroadcaster,
    recorder: Arc<ResultRecorder>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let role = args.role.unwrap_or(Role::All);

    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level, &config.service.log_format)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        ?role,
        "Starting results service"
    );

    if config.service.enable_metrics {
        init_metrics(config.service.metrics_port)?;
    }

    let components = build_components(config).await?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let queues = components.config.kafka.queues.clone();

    if role.runs(Role::Detect) {
        let worker = DetectionWorker::new(
            components.objects.clone(),
            components.detector.clone(),
            components.store.clone(),
            components.broker.clone(),
            queues.detection_results.clone(),
            RedeliveryPolicy::new(components.config.kafka.reliability.max_delivery_attempts),
        );
        spawn_consumer(
            &mut tasks,
            components.broker.clone(),
            queues.file_processing.clone(),
            Arc::new(worker),
            shutdown.clone(),
        );
    }

    if role.runs(Role::ResultsConsumer) {
        spawn_consumer(
            &mut tasks,
            components.broker.clone(),
            queues.detection_results.clone(),
            Arc::new(DetectionResultHandler::new(components.recorder.clone())),
            shutdown.clone(),
        );
    }

    if role.runs(Role::Reports) {
        let generator = ReportGenerator::new(
            components.store.clone(),
            components.objects.clone(),
            components.config.reports.artifact_prefix.clone(),
        );
        spawn_consumer(
            &mut tasks,
            components.broker.clone(),
            queues.report_generation.clone(),
            Arc::new(ReportConsumer::new(Arc::new(generator))),
            shutdown.clone(),
        );
    }

    if role.runs(Role::Serve) {
        let health = HealthAggregator::new(
            components.store.clone(),
            components.objects.clone(),
            components.broker.clone(),
            components.detector.clone(),
            components.progress.clone(),
            vec![
                queues.file_processing.clone(),
                queues.detection_results.clone(),
                queues.report_generation.clone(),
            ],
        )
        .with_timeout(components.config.health_check_timeout())
        .with_queue_depth_warning(components.config.health.queue_depth_warning);

        let state = AppState {
            store: components.store.clone(),
            recorder: components.recorder.clone(),
            broker: components.broker.clone(),
            health: Arc::new(health),
            progress: components.progress.clone(),
            report_queue: queues.report_generation.clone(),
        };
        let api_config = components.config.api.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = start_api_server(state, &api_config, shutdown.clone()).await;
            if let Err(e) = &result {
                error!(error = %e, "API server error, stopping service");
                shutdown.cancel();
            }
            result
        });
    }

    info!("Results service started successfully");

    tokio::select! {
        _ = shutdown_signal() => info!("Initiating graceful shutdown..."),
        _ = shutdown.cancelled() => warn!("A component stopped unexpectedly, shutting down"),
    }
    shutdown.cancel();

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Component failed");
                failures += 1;
            }
            Err(e) => {
                error!(error = %e, "Task panicked during shutdown");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} component(s) failed", failures);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn build_components(config: Config) -> Result<Components> {
    let store = PostgresJobStore::connect(&config.database)
        .await
        .context("Failed to initialize job store")?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);
    let broker: Arc<dyn MessageBroker> = Arc::new(
        KafkaBroker::new(config.kafka.clone()).context("Failed to initialize Kafka broker")?,
    );
    let detector = Arc::new(
        HttpDetector::new(config.inference.clone()).context("Failed to initialize detector client")?,
    );

    let store: Arc<dyn JobStore> = Arc::new(store);
    let progress = ProgressBroadcaster::new(config.api.event_buffer);
    let recorder = Arc::new(
        ResultRecorder::new(
            store.clone(),
            broker.clone(),
            progress.clone(),
            config.kafka.queues.report_generation.clone(),
        )
        .with_transaction_retries(
            config.recorder.max_transaction_retries,
            config.recorder.retry_backoff(),
        )
        .with_report_format(config.recorder.completion_report_format),
    );

    Ok(Components {
        config,
        store,
        objects,
        broker,
        detector,
        progress,
        recorder,
    })
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level))
        .add_directive("rdkafka=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
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
