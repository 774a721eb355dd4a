//! Transport abstraction.
//!
//! The engine talks to a broker through three traits: a [`Connector`] dials a
//! [`Connection`], which vends [`Channel`]s. Channels carry both directions:
//! consumers read a [`DeliveryStream`] from them and producers publish
//! through them.
//!
//! Two implementations ship with the crate:
//! - [`crate::memory::MemoryBroker`], an in-process broker for tests and embedding
//! - `AmqpConnector` (feature `amqp`), backed by `lapin`

use crate::delivery::Delivery;
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

/// Stream of inbound deliveries.
///
/// Yields `Err` for transport failures. Ends (`None`) when the channel is
/// closed; the matching [`CloseNotification`] tells whether the close was
/// clean.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// One-shot channel close notification.
///
/// Resolves with `None` for a clean close and `Some(cause)` when the broker
/// or network closed the channel with an error. A dropped sender counts as
/// a clean close.
pub type CloseNotification = oneshot::Receiver<Option<BrokerError>>;

/// Fan-out of a channel's close event to any number of subscribers.
///
/// Transports keep one per channel and fire it exactly once. Subscribing
/// after the fact yields the recorded cause immediately.
#[derive(Debug, Default)]
pub struct CloseSignal {
    fired: AtomicBool,
    inner: Mutex<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    cause: Option<String>,
    listeners: Vec<oneshot::Sender<Option<BrokerError>>>,
}

impl CloseSignal {
    /// Record the close and wake every subscriber. Returns `false` if the
    /// signal had already fired.
    pub fn fire(&self, cause: Option<String>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        for listener in inner.listeners.drain(..) {
            let _ = listener.send(cause.as_deref().map(|c| BrokerError::channel_closed(c)));
        }
        inner.cause = cause;
        true
    }

    pub fn subscribe(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fired.load(Ordering::Acquire) {
            let _ = tx.send(inner.cause.as_deref().map(|c| BrokerError::channel_closed(c)));
        } else {
            inner.listeners.push(tx);
        }
        rx
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Error cause, if the signal fired with one.
    pub fn cause(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cause
            .clone()
    }
}

/// Outbound message as handed to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub content_type: String,
    pub persistent: bool,
}

impl OutboundMessage {
    /// Persistent JSON message without attributes.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            attributes: HashMap::new(),
            content_type: "application/json".to_string(),
            persistent: true,
        }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Dials connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn dial(&self, address: &str) -> Result<Self::Connection, BrokerError>;
}

/// A long-lived broker session. Not self-healing: once closed, every channel
/// it vended is unusable and a new connection must be dialed.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Whether `name` is a declared topic. Never creates it.
    async fn topic_exists(&self, name: &str) -> Result<bool, BrokerError>;

    /// Whether `name` is a declared queue. Never creates it.
    async fn queue_exists(&self, name: &str) -> Result<bool, BrokerError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A lightweight session multiplexed on a connection.
///
/// Completion handles produced by [`Channel::consume`] may be resolved out of
/// order. Transports that need in-order acknowledgment serialize internally.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Idempotently declare a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Idempotently declare a durable fan-out topic.
    async fn declare_topic(&self, name: &str) -> Result<(), BrokerError>;

    /// Bind `queue` to `topic`. Both must already exist.
    async fn bind_queue(&self, queue: &str, topic: &str) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries pushed to this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming `queue` under `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    /// Publish to `destination` and return the message id.
    async fn publish(
        &self,
        destination: &str,
        message: OutboundMessage,
    ) -> Result<String, BrokerError>;

    /// Publish to every queue bound to `topic` and return the message id.
    ///
    /// Publishing to an undeclared topic closes the channel with an error.
    async fn publish_to_topic(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<String, BrokerError>;

    /// Register for the close notification. Every call returns a new receiver.
    fn notify_close(&self) -> CloseNotification;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}
