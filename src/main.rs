//! devrelay - device telemetry relay
//!
//! Accepts TCP connections from devices, decodes the JSON records they stream
//! and republishes each record's payload onto an AMQP fanout exchange.

use devrelay_server::metrics::run_metrics_server;
use devrelay_server::topology;
use devrelay_server::{
    AmqpSink, Config, Metrics, PublishPort, PublishTarget, Server, ServerConfig, ServerError,
    Topology,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Every failure is logged where it happens
    run().await?;

    tracing::info!("Relay stopped");
    Ok(())
}

async fn run() -> Result<(), ServerError> {
    // Defaults, then DEVRELAY_CONFIG, then .env, then the environment
    let config =
        Config::load().inspect_err(|e| tracing::error!("Failed to load config: {}", e))?;
    if let Ok(path) = std::env::var("DEVRELAY_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }
    config
        .validate()
        .inspect_err(|e| tracing::error!("Invalid configuration: {}", e))?;

    tracing::info!("Starting devrelay");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Exchange: {}", config.broker.exchange);
    if config.broker.queue.is_empty() {
        tracing::info!("  Queue: none");
    } else {
        tracing::info!("  Queue: {}", config.broker.queue);
    }
    match config.network.idle_timeout() {
        Some(timeout) => tracing::info!("  Idle timeout: {:?}", timeout),
        None => tracing::info!("  Idle timeout: disabled"),
    }
    if config.network.max_connections > 0 {
        tracing::info!("  Max connections: {}", config.network.max_connections);
    }

    // Broker connection stays open for the lifetime of the process
    let (connection, channel) = topology::connect(&config.broker)
        .await
        .inspect_err(|e| tracing::error!("Failed to connect to broker: {}", e))?;

    Topology::from_config(&config.broker)
        .declare(&channel)
        .await
        .inspect_err(|e| tracing::error!("Failed to declare broker topology: {}", e))?;

    let (port, publisher_handle) = PublishPort::spawn(
        AmqpSink::new(channel),
        PublishTarget::from_config(&config.broker),
        config.broker.publish_queue_depth,
    );

    let mut server_config = ServerConfig::from_config(&config);
    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Metrics::new()
            .map(Arc::new)
            .inspect_err(|e| tracing::error!("Failed to register metrics: {}", e))?;
        server_config = server_config.with_metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, port));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping relay...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    let result = server.run().await.inspect_err(|e| {
        tracing::error!(
            "Failed to listen on {}: {}",
            config.network.bind_addr,
            e
        )
    });

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    // In-flight handlers are not drained; the actor stops with the process.
    publisher_handle.abort();
    if let Err(e) = connection.close(200, "relay shutting down").await {
        tracing::debug!("Broker connection close failed: {}", e);
    }

    result
}
