use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use batching_consumer::config::Config;
use batching_consumer::kafka::client::KafkaBrokerClient;
use batching_consumer::metrics_server::{health_router, serve, setup_metrics_routes};
use batching_consumer::processor::JsonPayloadProcessor;
use batching_consumer::shutdown::ShutdownCoordinator;
use batching_consumer::ConsumerLoop;

fn setup_tracing() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("rdkafka=warn".parse()?);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let log_layer = if json {
        tracing_subscriber::fmt::layer().json().with_filter(filter).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter).boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = setup_metrics_routes(health_router())
        .context("Failed to install the prometheus recorder")?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server on {bind} stopped: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing()?;
    info!("Starting batching consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    let settings = config.validate().context("Invalid configuration")?;

    info!(
        topics = ?settings.topics,
        group_id = settings.group_id,
        dead_letter_topic = settings.dead_letter_topic,
        concurrency = settings.concurrency,
        max_batch_size = settings.max_batch_size,
        max_batch_time_ms = settings.max_batch_time.as_millis() as u64,
        auto_offset_reset = settings.auto_offset_reset.as_str(),
        "Configuration loaded"
    );

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let shutdown = ShutdownCoordinator::new();
    let signal_handle = shutdown
        .install_signal_handlers()
        .context("Failed to install signal handlers")?;

    let client = Arc::new(
        KafkaBrokerClient::new(&settings).context("Failed to create the Kafka client")?,
    );
    let consumer = ConsumerLoop::new(
        client,
        Arc::new(JsonPayloadProcessor),
        &settings,
        shutdown,
    );

    let result = consumer.run().await;

    signal_handle.abort();
    server_handle.abort();

    result.context("Consumer stopped on a fatal error")?;
    info!("Batching consumer shut down");
    Ok(())
}
