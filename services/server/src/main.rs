use anyhow::{Context, Result};
use relay_pipeline::BusConnector;
use relay_server::api::start_api_server;
use relay_server::{
    AppState, Config, EventStore, IngestionPipeline, MemoryStore, PgStore, StorageBackend,
    TopicRegistry,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.storage.backend,
        "Starting relay server"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let (registry, store) = init_storage(&config).await?;
    let bus = init_bus(&config)?;

    let pipeline = Arc::new(IngestionPipeline::new(registry.clone(), store.clone(), bus.clone()));

    // Bus -> dispatcher
    let (tx, rx) = mpsc::channel(config.ingestion.channel_capacity.max(1));
    let bus_task = bus.clone();
    let bus_handle = tokio::spawn(async move {
        if let Err(e) = bus_task.run(tx).await {
            error!(error = %e, "Bus connector error");
        }
    });

    let dispatcher = pipeline.clone();
    let dispatch_handle = tokio::spawn(async move { dispatcher.run(rx).await });

    // Previously committed topics are back on the bus before new requests are accepted
    let report = pipeline
        .resume(&config.ingestion.excluded_topics)
        .await
        .context("Failed to read topic registry")?;
    if !report.failed.is_empty() {
        warn!(topics = ?report.failed, "Some topics could not be resumed, retrying in background");
    }

    let cancel = CancellationToken::new();
    let retry_pipeline = pipeline.clone();
    let retry_cancel = cancel.clone();
    let retry_interval = config.resume_retry_interval();
    let retry_handle = tokio::spawn(async move {
        retry_pipeline
            .run_resume_retry(retry_interval, retry_cancel)
            .await
    });

    let api_state = AppState {
        registry,
        store,
        pipeline: pipeline.clone(),
    };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        let shutdown = async move { api_cancel.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Relay server started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down relay server");

    cancel.cancel();
    bus.shutdown();

    let _ = api_handle.await;
    let _ = retry_handle.await;
    let _ = bus_handle.await;
    let _ = dispatch_handle.await;

    // Let in-flight writes land
    pipeline.flush().await;

    info!("Relay server stopped");

    Ok(())
}

async fn init_storage(config: &Config) -> Result<(Arc<dyn TopicRegistry>, Arc<dyn EventStore>)> {
    match config.storage.backend {
        StorageBackend::Postgres => {
            let store = Arc::new(
                PgStore::new(&config.database)
                    .await
                    .context("Failed to initialize event store")?,
            );

            // Run migrations if enabled
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            let registry: Arc<dyn TopicRegistry> = store.clone();
            Ok((registry, store))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            let registry: Arc<dyn TopicRegistry> = store.clone();
            Ok((registry, store))
        }
    }
}

#[cfg(feature = "kafka")]
fn init_bus(config: &Config) -> Result<Arc<dyn BusConnector>> {
    config.bus.validate().context("Invalid bus configuration")?;
    let connector = relay_pipeline::KafkaConnector::new(config.bus.clone())
        .context("Failed to initialize Kafka connector")?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "kafka"))]
fn init_bus(_config: &Config) -> Result<Arc<dyn BusConnector>> {
    warn!("Built without Kafka support, using in-process bus");
    Ok(Arc::new(relay_pipeline::MemoryBus::new()))
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
