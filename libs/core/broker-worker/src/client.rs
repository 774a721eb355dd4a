//! Connection supervisor.
//!
//! Besides queues, a [`Client`] manages topics and subscriptions. Creating
//! either is idempotent; building a publisher or subscriber requires the
//! topic or subscription to exist already.

use crate::config::{ConsumerConfig, ProducerConfig};
use crate::consumer::QueueConsumer;
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::producer::{Producer, TopicPublisher};
use crate::transport::{Channel, Connection, Connector};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Owns one broker connection and vends consumers and producers on it.
///
/// The connection is not self-healing. Once [`Client::is_closed`] reports
/// `true`, build a new client.
pub struct Client<C: Connection> {
    connection: Arc<C>,
    shutdown: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl<C: Connection> Client<C> {
    /// Dial `address` through `connector`. No dial retries are attempted.
    pub async fn connect<K>(
        connector: &K,
        address: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, BrokerError>
    where
        K: Connector<Connection = C>,
    {
        if address.trim().is_empty() {
            return Err(BrokerError::invalid("connection address cannot be empty"));
        }

        let connection = connector
            .dial(address)
            .await
            .map_err(|e| BrokerError::connection(format!("failed to dial broker: {e}")))?;
        if connection.is_closed() {
            return Err(BrokerError::connection("connection closed right after dialing"));
        }

        info!("Connected to broker");
        Ok(Self::from_connection(connection, shutdown))
    }

    /// Wrap an already dialed connection.
    pub fn from_connection(connection: C, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            connection: Arc::new(connection),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.is_closed()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    /// Open a raw channel on the connection.
    pub async fn open_channel(&self) -> Result<C::Channel, BrokerError> {
        self.ensure_open()?;
        self.connection.open_channel().await
    }

    /// Build a consumer for `queue` with default settings.
    pub fn new_consumer<H: Handler>(
        &self,
        name: &str,
        queue: &str,
        handler: H,
    ) -> Result<QueueConsumer<C, H>, BrokerError> {
        self.new_consumer_with_config(ConsumerConfig::new(name, queue), handler)
    }

    pub fn new_consumer_with_config<H: Handler>(
        &self,
        config: ConsumerConfig,
        handler: H,
    ) -> Result<QueueConsumer<C, H>, BrokerError> {
        if config.consumer_name.trim().is_empty() {
            return Err(BrokerError::invalid("consumer name cannot be empty"));
        }
        if config.queue_name.trim().is_empty() {
            return Err(BrokerError::invalid("queue name cannot be empty"));
        }
        self.ensure_open()?;

        Ok(QueueConsumer::new(
            Arc::clone(&self.connection),
            config,
            handler,
            self.shutdown.clone(),
        ))
    }

    /// Build a producer and open its first channel.
    pub async fn new_producer(&self) -> Result<Producer<C>, BrokerError> {
        self.new_producer_with_config(ProducerConfig::default())
            .await
    }

    pub async fn new_producer_with_config(
        &self,
        config: ProducerConfig,
    ) -> Result<Producer<C>, BrokerError> {
        self.ensure_open()?;
        Producer::open(Arc::clone(&self.connection), config, self.shutdown.clone()).await
    }

    /// Idempotently declare a durable queue.
    pub async fn create_queue(&self, name: &str) -> Result<(), BrokerError> {
        if name.trim().is_empty() {
            return Err(BrokerError::invalid("queue name cannot be empty"));
        }

        let channel = self.open_channel().await?;
        let declared = channel.declare_queue(name).await;
        close_admin_channel(&channel).await;
        declared?;

        info!(queue = name, "Queue declared");
        Ok(())
    }

    /// Create a durable fan-out topic unless it already exists.
    pub async fn create_topic(&self, name: &str) -> Result<(), BrokerError> {
        if name.trim().is_empty() {
            return Err(BrokerError::invalid("topic name cannot be empty"));
        }
        self.ensure_open()?;

        if self.connection.topic_exists(name).await? {
            debug!(topic = name, "Topic already exists");
            return Ok(());
        }

        let channel = self.open_channel().await?;
        let declared = channel.declare_topic(name).await;
        close_admin_channel(&channel).await;
        declared?;

        info!(topic = name, "Topic created");
        Ok(())
    }

    /// Create subscription `name` on `topic` unless it already exists.
    ///
    /// A subscription is a durable queue bound to the topic. Fails with
    /// [`BrokerError::NotFound`] when the topic does not exist.
    pub async fn create_subscription(&self, name: &str, topic: &str) -> Result<(), BrokerError> {
        if name.trim().is_empty() {
            return Err(BrokerError::invalid("subscription name cannot be empty"));
        }
        if topic.trim().is_empty() {
            return Err(BrokerError::invalid("topic name cannot be empty"));
        }
        self.ensure_open()?;

        if !self.connection.topic_exists(topic).await? {
            return Err(BrokerError::not_found(format!("topic {topic}")));
        }
        let existed = self.connection.queue_exists(name).await?;

        let channel = self.open_channel().await?;
        let created = match channel.declare_queue(name).await {
            Ok(()) => channel.bind_queue(name, topic).await,
            Err(e) => Err(e),
        };
        close_admin_channel(&channel).await;
        created?;

        if existed {
            debug!(subscription = name, topic, "Subscription already exists");
        } else {
            info!(subscription = name, topic, "Subscription created");
        }
        Ok(())
    }

    /// Build a publisher for an existing topic.
    pub async fn new_publisher(&self, topic: &str) -> Result<TopicPublisher<C>, BrokerError> {
        if topic.trim().is_empty() {
            return Err(BrokerError::invalid("topic name cannot be empty"));
        }
        self.ensure_open()?;
        if !self.connection.topic_exists(topic).await? {
            return Err(BrokerError::not_found(format!("topic {topic}")));
        }

        let producer = self
            .new_producer_with_config(ProducerConfig::default().with_declare_destination(false))
            .await?;
        Ok(TopicPublisher::new(producer, topic))
    }

    /// Build a consumer for an existing subscription. The subscription queue
    /// is consumed as is and never declared.
    pub async fn new_subscriber<H: Handler>(
        &self,
        name: &str,
        subscription: &str,
        handler: H,
    ) -> Result<QueueConsumer<C, H>, BrokerError> {
        if subscription.trim().is_empty() {
            return Err(BrokerError::invalid("subscription name cannot be empty"));
        }
        self.ensure_open()?;
        if !self.connection.queue_exists(subscription).await? {
            return Err(BrokerError::not_found(format!("subscription {subscription}")));
        }

        let config = ConsumerConfig::new(name, subscription).with_declare_queue(false);
        self.new_consumer_with_config(config, handler)
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.connection.is_closed() {
            self.connection.close().await?;
        }
        info!("Broker connection closed");
        Ok(())
    }
}

async fn close_admin_channel<Ch: Channel>(channel: &Ch) {
    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to close admin channel");
    }
}
