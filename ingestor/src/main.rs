use anyhow::Context;
use climate_ingestor::config::Config;
use climate_ingestor::db::{SqliteStore, StoreOptions};
use climate_ingestor::mqtt::{self, MqttSettings};
use climate_ingestor::retention::RetentionManager;
use climate_ingestor::service::{ServiceOptions, TelemetryService};
use climate_ingestor::{batching, metrics, rest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("Invalid configuration")?;

    info!("Starting climate ingestor");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_path.display());
    info!(
        "Retention horizon: {}s, prune interval: {}s, max future skew: {}s",
        config.retention_horizon.as_secs(),
        config.prune_interval.as_secs(),
        config.max_future_skew.as_secs()
    );

    metrics::init_metrics();

    let store = Arc::new(
        SqliteStore::open(
            &config.database_path,
            StoreOptions {
                max_connections: config.db_max_connections,
                prune_batch_size: config.prune_batch_size,
            },
        )
        .await
        .context("Failed to open database")?,
    );

    let service = Arc::new(TelemetryService::new(
        Arc::clone(&store),
        ServiceOptions {
            retention_horizon: config.retention_horizon_chrono(),
            max_future_skew: config.max_future_skew_chrono(),
            max_windows: config.max_windows,
        },
    ));

    let ctx = CancellationToken::new();

    let retention = RetentionManager::new(
        Arc::clone(&store),
        config.retention_horizon_chrono(),
        config.prune_interval,
    );
    let retention_handle = tokio::spawn(retention.run(ctx.clone()));

    let mut mqtt_handle = None;
    let mut batcher_handle = None;
    if config.mqtt_enabled {
        info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
        info!("Channel capacity: {}", config.channel_capacity);
        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let settings = MqttSettings {
            broker: config.mqtt_broker.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            topic: config.mqtt_topic.clone(),
        };
        let mqtt_service = Arc::clone(&service);
        let mqtt_ctx = ctx.clone();
        mqtt_handle = Some(tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(settings, mqtt_service, tx, mqtt_ctx).await {
                error!("MQTT task failed: {}", e);
            }
        }));

        // Ends once the MQTT task drops its sender.
        batcher_handle = Some(tokio::spawn(batching::run_batcher(
            rx,
            Arc::clone(&service),
            config.batch_size,
            config.batch_timeout_ms,
        )));
    }

    let app = rest::create_router(Arc::clone(&service), &config.cors_origins);
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_ctx = ctx.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_ctx.cancelled().await })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    let mut server_running = true;
    tokio::select! {
        _ = &mut server_handle => {
            error!("HTTP server terminated");
            server_running = false;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    ctx.cancel();

    if let Some(handle) = mqtt_handle {
        let _ = handle.await;
    }
    if let Some(handle) = batcher_handle {
        let _ = handle.await;
    }
    let _ = retention_handle.await;
    if server_running {
        let _ = server_handle.await;
    }

    store.close().await.context("Failed to flush database")?;
    info!("Shutdown complete");
    Ok(())
}
