//! Self-healing message producer.
//!
//! A [`Producer`] publishes through one channel at a time. The channel lives
//! in a mutex-guarded slot; a background observer marks the slot closed when
//! the broker closes the channel, and the next publish reopens it from the
//! connection. A closed connection is never reopened: publishes fail fast
//! with [`BrokerError::ConnectionClosed`].
//!
//! [`TopicPublisher`] binds a producer to one topic.

use crate::config::ProducerConfig;
use crate::error::BrokerError;
use crate::metrics::PublisherMetrics;
use crate::shutdown::cancelled;
use crate::transport::{Channel, CloseNotification, Connection, OutboundMessage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a message is sent.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Queue(&'a str),
    Topic(&'a str),
}

impl<'a> Target<'a> {
    fn name(self) -> &'a str {
        match self {
            Target::Queue(name) | Target::Topic(name) => name,
        }
    }
}

/// One channel generation plus its close observer.
struct ChannelSlot<Ch> {
    channel: Arc<Ch>,
    closed: Arc<AtomicBool>,
    observer: JoinHandle<()>,
}

impl<Ch: Channel> ChannelSlot<Ch> {
    fn is_usable(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.channel.is_closed()
    }
}

impl<Ch> Drop for ChannelSlot<Ch> {
    fn drop(&mut self) {
        self.observer.abort();
    }
}

/// Publishes JSON messages, reopening its channel after a transient close.
pub struct Producer<C: Connection> {
    connection: Arc<C>,
    slot: Mutex<Option<ChannelSlot<C::Channel>>>,
    stopped: AtomicBool,
    reconnects: AtomicU64,
    config: ProducerConfig,
    shutdown: watch::Receiver<bool>,
    metrics: PublisherMetrics,
}

impl<C: Connection> Producer<C> {
    /// Create a producer that opens its channel on first publish.
    pub fn new(
        connection: Arc<C>,
        config: ProducerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connection,
            slot: Mutex::new(None),
            stopped: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            config,
            shutdown,
            metrics: PublisherMetrics,
        }
    }

    /// Create a producer and open its first channel.
    pub async fn open(
        connection: Arc<C>,
        config: ProducerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, BrokerError> {
        let producer = Self::new(connection, config, shutdown);
        let slot = producer.open_slot().await?;
        *producer.slot.lock().await = Some(slot);
        Ok(producer)
    }

    /// Number of times a closed channel was replaced.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Publish `body` as JSON to `destination` and return the message id.
    pub async fn publish<T>(&self, destination: &str, body: &T) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_attributes(destination, body, HashMap::new())
            .await
    }

    /// Publish `body` with string attributes (message headers).
    pub async fn publish_with_attributes<T>(
        &self,
        destination: &str,
        body: &T,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_to(Target::Queue(destination.trim()), body, attributes)
            .await
    }

    /// Publish `body` as JSON to every subscription of `topic`.
    pub async fn publish_to_topic<T>(&self, topic: &str, body: &T) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_to_topic_with_attributes(topic, body, HashMap::new())
            .await
    }

    pub async fn publish_to_topic_with_attributes<T>(
        &self,
        topic: &str,
        body: &T,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_to(Target::Topic(topic.trim()), body, attributes)
            .await
    }

    async fn publish_to<T>(
        &self,
        target: Target<'_>,
        body: &T,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        let destination = target.name();
        let result = self.try_publish(target, body, attributes).await;

        match &result {
            Ok(message_id) => {
                self.metrics.published(destination);
                debug!(destination, message_id = %message_id, "Message published");
            }
            Err(e) => {
                self.metrics.failed(destination, e.kind().as_str());
                warn!(destination, error = %e, "Publish failed");
            }
        }
        result
    }

    async fn try_publish<T>(
        &self,
        target: Target<'_>,
        body: &T,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(BrokerError::ProducerClosed);
        }
        if target.name().is_empty() {
            return Err(BrokerError::EmptyDestination);
        }

        let message = OutboundMessage {
            body: encode(body)?,
            attributes,
            content_type: self.config.content_type.clone(),
            persistent: self.config.persistent,
        };

        let mut guard = self.slot.lock().await;
        let slot = &mut *guard;
        if self.is_closed() {
            return Err(BrokerError::ProducerClosed);
        }
        if self.connection.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }

        let mut reconnected = false;
        if !slot.as_ref().is_some_and(ChannelSlot::is_usable) {
            if slot.is_some() {
                info!("Producer channel closed, reopening");
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                self.metrics.reconnected();
            }
            *slot = Some(self.open_slot().await.map_err(|e| self.classify(e))?);
            reconnected = true;
        }

        let Some(current) = slot.as_ref() else {
            return Err(BrokerError::channel_closed("no producer channel"));
        };

        match self.send(&current.channel, target, message.clone()).await {
            Ok(message_id) => Ok(message_id),
            Err(err) if !reconnected && err.is_retryable() && !current.is_usable() => {
                warn!(
                    destination = target.name(),
                    error = %err,
                    "Channel closed during publish, reopening once"
                );
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                self.metrics.reconnected();

                let fresh = self.open_slot().await.map_err(|e| self.classify(e))?;
                let fresh = slot.insert(fresh);
                self.send(&fresh.channel, target, message).await
            }
            Err(err) => Err(err),
        }
    }

    async fn send(
        &self,
        channel: &C::Channel,
        target: Target<'_>,
        message: OutboundMessage,
    ) -> Result<String, BrokerError> {
        let sent = match target {
            Target::Queue(queue) => {
                if self.config.declare_destination {
                    channel
                        .declare_queue(queue)
                        .await
                        .map_err(|e| self.classify(e))?;
                }
                channel.publish(queue, message).await
            }
            Target::Topic(topic) => channel.publish_to_topic(topic, message).await,
        };
        sent.map_err(|e| self.classify(e))
    }

    /// Map a send or reopen failure to `ConnectionClosed` or `Transport`.
    fn classify(&self, err: BrokerError) -> BrokerError {
        if self.connection.is_closed() {
            return BrokerError::ConnectionClosed;
        }
        match err {
            BrokerError::ConnectionClosed => BrokerError::ConnectionClosed,
            err @ BrokerError::Transport(_) => err,
            other => BrokerError::transport(other.to_string()),
        }
    }

    async fn open_slot(&self) -> Result<ChannelSlot<C::Channel>, BrokerError> {
        if self.connection.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }

        let channel = self.connection.open_channel().await.map_err(|e| {
            if self.connection.is_closed() {
                BrokerError::ConnectionClosed
            } else {
                e
            }
        })?;
        let closed = Arc::new(AtomicBool::new(false));
        let observer = tokio::spawn(observe_close(
            channel.notify_close(),
            Arc::clone(&closed),
            self.shutdown.clone(),
        ));

        debug!("Producer channel opened");
        Ok(ChannelSlot {
            channel: Arc::new(channel),
            closed,
            observer,
        })
    }

    /// Close the current channel. Later publishes fail with `ProducerClosed`.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let slot = self.slot.lock().await.take();
        if let Some(slot) = slot {
            if !slot.channel.is_closed() {
                slot.channel.close().await?;
            }
        }
        info!("Producer closed");
        Ok(())
    }
}

/// Publishes to a single topic.
///
/// Built by [`crate::Client::new_publisher`], which fails when the topic does
/// not exist.
pub struct TopicPublisher<C: Connection> {
    producer: Producer<C>,
    topic: String,
}

impl<C: Connection> TopicPublisher<C> {
    pub fn new(producer: Producer<C>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn reconnect_count(&self) -> u64 {
        self.producer.reconnect_count()
    }

    pub async fn publish<T>(&self, body: &T) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.producer.publish_to_topic(&self.topic, body).await
    }

    pub async fn publish_with_attributes<T>(
        &self,
        body: &T,
        attributes: HashMap<String, String>,
    ) -> Result<String, BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.producer
            .publish_to_topic_with_attributes(&self.topic, body, attributes)
            .await
    }

    /// Stop publishing and close the channel. Idempotent.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        self.producer.close().await
    }
}

/// Mark `closed` once the channel closes; stop early on shutdown.
async fn observe_close(
    notification: CloseNotification,
    closed: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        cause = notification => {
            closed.store(true, Ordering::Release);
            match cause {
                Ok(Some(e)) => warn!(error = %e, "Producer channel closed by broker"),
                _ => debug!("Producer channel closed"),
            }
        }
        _ = cancelled(&mut shutdown) => {
            debug!("Shutdown signal received, producer channel observer exiting");
        }
    }
}

/// Encode a body as JSON, rejecting bodies that encode to `null`.
fn encode<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>, BrokerError> {
    let bytes = serde_json::to_vec(body)?;
    if bytes == b"null" {
        return Err(BrokerError::EmptyBody);
    }
    Ok(bytes)
}
