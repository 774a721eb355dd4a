//! Relay Worker Service
//!
//! A background worker that consumes a broker queue with bounded concurrency
//! and optionally republishes every message to a relay queue.
//!
//! ## Architecture
//!
//! ```text
//! AMQP queue (BROKER_QUEUE)
//!   ↓ (prefetch = BROKER_CONCURRENCY)
//! QueueConsumer<AmqpConnection, RelayHandler>
//!   ↓ (ack on success, reject + requeue on failure or panic)
//! Producer (self-healing channel)
//!   ↓
//! AMQP queue (BROKER_RELAY_QUEUE, optional)
//! ```
//!
//! ## Features
//!
//! - Graceful shutdown on SIGINT/SIGTERM: in-flight messages finish first
//! - Exit status reflects how consumption ended: a broker-side failure is an
//!   error, shutdown or a clean close is success
//! - Health, readiness and Prometheus endpoints

mod handler;
mod server;

pub use handler::RelayHandler;
pub use server::{HealthState, health_router};

use broker_worker::{AmqpConnector, Client, Connector, init_metrics};
use core_config::broker::BrokerConfig;
use core_config::{Environment, FromEnv, env_parse_or};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_HEALTH_PORT: u16 = 8082;

/// Run the relay worker
///
/// 1. Sets up error reporting, structured logging and metrics
/// 2. Loads the broker configuration
/// 3. Starts the health server
/// 4. Consumes until shutdown or a broker failure
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting relay worker service"
    );
    info!("Environment: {:?}", environment);

    let config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let health_port = env_parse_or("HEALTH_PORT", DEFAULT_HEALTH_PORT)
        .wrap_err("Failed to load health server port")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    run_worker(&AmqpConnector::default(), &config, shutdown_rx, Some(health_port)).await
}

/// Connect through `connector` and consume until shutdown or failure.
///
/// The health server is started when `health_port` is set.
pub async fn run_worker<K: Connector>(
    connector: &K,
    config: &BrokerConfig,
    shutdown: watch::Receiver<bool>,
    health_port: Option<u16>,
) -> Result<()> {
    info!(
        queue = %config.queue,
        consumer = %config.consumer_name,
        concurrency = config.concurrency,
        relay_queue = ?config.relay_queue,
        "Worker configuration loaded"
    );

    let client = Client::connect(connector, &config.url, shutdown.clone())
        .await
        .wrap_err("Failed to connect to broker")?;

    let handler = match &config.relay_queue {
        Some(queue) => {
            let producer = client
                .new_producer()
                .await
                .wrap_err("Failed to open relay producer")?;
            Arc::new(RelayHandler::relaying(producer, queue.clone()))
        }
        None => Arc::new(RelayHandler::logging()),
    };

    let consumer = client
        .new_consumer(&config.consumer_name, &config.queue, Arc::clone(&handler))
        .wrap_err("Failed to create consumer")?;

    if let Some(port) = health_port {
        let state = HealthState {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            queue: config.queue.clone(),
            engine: consumer.state(),
        };
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(state, port, shutdown).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let consumed = consumer.consume(config.concurrency).await;

    handler.close().await;
    if let Err(e) = client.close().await {
        error!(error = %e, "Failed to close broker connection");
    }

    consumed.wrap_err("Consumer stopped with a broker failure")?;
    info!("Relay worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
