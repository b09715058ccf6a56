use anyhow::{Context, Result};
use archiver::config::{Config, LogFormat};
use archiver::{
    ensure_bucket, Archiver, KafkaConfirmationPublisher, KafkaEventSource, ObjectKeyGenerator,
    S3ObjectStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.log_format);

    info!(
        service = %config.service.name,
        "Starting archiver service"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let store = Arc::new(S3ObjectStore::new(&config.object_store).await);

    ensure_bucket(store.as_ref(), &config.object_store.bucket)
        .await
        .context("Failed to ensure bucket exists")?;

    let source = Arc::new(
        KafkaEventSource::new(&config.kafka).context("Failed to initialize Kafka consumer")?,
    );
    let publisher = Arc::new(
        KafkaConfirmationPublisher::new(&config.kafka)
            .context("Failed to initialize Kafka producer")?,
    );

    let archiver = Archiver::new(
        source,
        store,
        publisher,
        ObjectKeyGenerator::system(config.archiver.key_scheme),
        config.object_store.bucket.clone(),
    );

    info!(
        input_topic = %config.kafka.input_topic,
        output_topic = %config.kafka.output_topic,
        "Archiver service started"
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    archiver.run(shutdown).await;

    info!("Archiver service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
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
