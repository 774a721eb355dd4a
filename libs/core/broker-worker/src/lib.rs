//! Broker Worker
//!
//! Reliable message consumption and self-healing publication over a
//! pluggable broker transport.
//!
//! ## Features
//!
//! - **Bounded concurrency**: at most N deliveries are processed at once
//! - **Exactly-once resolution**: every admitted delivery is acknowledged or
//!   rejected exactly once
//! - **Panic isolation**: a panicking handler rejects its delivery with
//!   requeue and never takes down the consumer
//! - **Graceful drain**: shutdown waits for in-flight deliveries
//! - **Self-healing producer**: a closed channel is reopened once per publish;
//!   a closed connection fails fast
//! - **Topics and subscriptions**: fan-out topics with one queue per
//!   subscription, created idempotently
//! - **Prometheus metrics**: consumer and publisher counters
//! - **Transports**: in-memory broker built in, AMQP via `lapin` behind the
//!   `amqp` feature
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │    Client    │ owns the connection
//!                 └──────┬───────┘
//!             ┌──────────┴──────────┐
//!     ┌───────▼───────┐     ┌───────▼───────┐
//!     │ QueueConsumer │     │   Producer    │
//!     └───────┬───────┘     └───────┬───────┘
//!             │ DeliveryStream      │ Mutex<Option<ChannelSlot>>
//!     ┌───────▼───────┐             │
//!     │  WorkerPool   │             ▼
//!     └───────┬───────┘        Channel::publish
//!             │ JoinSet
//!     ┌───────▼───────┐
//!     │    Handler    │ → ack / reject(requeue)
//!     └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use broker_worker::{Client, MemoryBroker, handler_fn};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let client = Client::connect(&MemoryBroker::new(), "memory://local", shutdown_rx).await?;
//!
//! let producer = client.new_producer().await?;
//! producer.publish("orders", &serde_json::json!({"id": 1})).await?;
//!
//! let consumer = client.new_consumer("order-worker", "orders", handler_fn(|payload, _| async move {
//!     println!("{}", String::from_utf8_lossy(&payload));
//!     Ok(())
//! }))?;
//! consumer.consume(4).await?;
//! ```

#[cfg(feature = "amqp")]
mod amqp;
mod client;
mod config;
mod consumer;
mod delivery;
mod error;
mod handler;
pub mod memory;
pub mod metrics;
mod pool;
mod producer;
mod shutdown;
mod transport;

// Re-export main types
#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection, AmqpConnector};
pub use client::Client;
pub use config::{ConsumerConfig, ProducerConfig};
pub use consumer::{ConsumptionEngine, EngineState, QueueConsumer};
pub use delivery::{CompletionHandle, Delivery, Outcome};
pub use error::{BrokerError, ErrorKind};
pub use handler::{FailingHandler, FnHandler, Handler, HandlerError, NoOpHandler, handler_fn};
pub use memory::MemoryBroker;
pub use metrics::{ConsumerMetrics, PublisherMetrics, init_metrics, render_metrics};
pub use pool::{ConcurrencyToken, WorkerPool};
pub use producer::{Producer, TopicPublisher};
pub use shutdown::cancelled;
pub use transport::{
    Channel, CloseNotification, CloseSignal, Connection, Connector, DeliveryStream,
    OutboundMessage,
};

// Re-export async_trait for handler implementations
pub use async_trait::async_trait;
