//! In-process broker.
//!
//! [`MemoryBroker`] implements the transport traits over in-memory queues.
//! It is used by the test suite and by applications that embed the worker
//! without an external broker. Every failure the engine has to survive can be
//! injected: channel closes (clean or with an error), connection loss,
//! failing publishes or channel opens, refused dials and queues that stop
//! delivering.
//!
//! Semantics follow AMQP where it matters:
//! - a rejected delivery with `requeue = true` goes back to the head of its
//!   queue flagged as redelivered
//! - publishing to an undeclared queue silently drops the message
//! - a topic copies each message to every queue bound to it; publishing to
//!   or binding an undeclared topic closes the channel with an error
//! - consuming an undeclared queue closes the channel with an error
//! - closing a connection closes all of its channels

use crate::delivery::{CompletionHandle, Delivery};
use crate::error::BrokerError;
use crate::transport::{
    Channel, CloseNotification, CloseSignal, Connection, Connector, DeliveryStream,
    OutboundMessage,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// A message stored in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub content_type: String,
    pub persistent: bool,
    pub redelivered: bool,
}

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Rejected { requeue: bool },
}

#[derive(Default)]
struct Stats {
    channels_opened: AtomicU64,
    published: AtomicU64,
    unroutable: AtomicU64,
    acks: AtomicU64,
    rejects: AtomicU64,
    requeues: AtomicU64,
}

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.messages).push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.messages).push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.messages).pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    topics: Mutex<HashMap<String, Vec<String>>>,
    connections: Mutex<Vec<Weak<ConnectionState>>>,
    resolutions: Mutex<Vec<(String, Resolution)>>,
    refuse_dials: AtomicBool,
    failing_publishes: AtomicUsize,
    closing_publishes: AtomicUsize,
    failing_opens: AtomicUsize,
    last_prefetch: AtomicUsize,
    next_message_id: AtomicU64,
    next_channel_id: AtomicU64,
    stats: Stats,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn next_message_id(&self) -> String {
        (self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn declare(&self, name: &str) -> Arc<MemoryQueue> {
        Arc::clone(lock(&self.queues).entry(name.to_string()).or_default())
    }

    fn declare_topic(&self, name: &str) {
        lock(&self.topics).entry(name.to_string()).or_default();
    }

    fn has_topic(&self, name: &str) -> bool {
        lock(&self.topics).contains_key(name)
    }

    /// Queues bound to `topic`, or `None` if the topic is undeclared.
    fn bound_queues(&self, topic: &str) -> Option<Vec<Arc<MemoryQueue>>> {
        let names = lock(&self.topics).get(topic)?.clone();
        Some(names.iter().filter_map(|name| self.queue(name)).collect())
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionState>> {
        let mut connections = lock(&self.connections);
        connections.retain(|c| c.strong_count() > 0);
        connections.iter().filter_map(Weak::upgrade).collect()
    }
}

#[derive(Default)]
struct ConnectionState {
    closed: AtomicBool,
    channels: Mutex<Vec<Weak<ChannelState>>>,
}

impl ConnectionState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn live_channels(&self) -> Vec<Arc<ChannelState>> {
        let mut channels = lock(&self.channels);
        channels.retain(|c| c.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    fn close(&self, cause: Option<&str>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel in self.live_channels() {
            channel.close(cause.map(str::to_string));
        }
    }
}

#[derive(Default)]
struct ChannelState {
    id: u64,
    signal: CloseSignal,
    notify: Notify,
}

impl ChannelState {
    fn close(&self, cause: Option<String>) {
        if self.signal.fire(cause) {
            debug!(channel_id = self.id, "Memory channel closed");
            self.notify.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.signal.is_fired()
    }

    fn closed_error(&self) -> BrokerError {
        BrokerError::channel_closed(
            self.signal
                .cause()
                .unwrap_or_else(|| "channel closed".to_string()),
        )
    }
}

/// In-process broker and its [`Connector`].
///
/// Cloning is cheap; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `queue` and append a message to it.
    pub fn push(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
    ) -> String {
        let message_id = self.state.next_message_id();
        self.state.declare(queue).push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            attributes,
            content_type: "application/json".to_string(),
            persistent: true,
            redelivered: false,
        });
        message_id
    }

    // Fault injection

    /// Close every open channel, with an error when `cause` is set.
    pub fn close_channels(&self, cause: Option<&str>) {
        for connection in self.state.live_connections() {
            for channel in connection.live_channels() {
                channel.close(cause.map(str::to_string));
            }
        }
    }

    /// Drop every connection. Their channels close with an error.
    pub fn drop_connections(&self) {
        for connection in self.state.live_connections() {
            connection.close(Some("connection lost"));
        }
    }

    /// Fail the next `count` publishes with a transport error. The channel
    /// stays open.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.failing_publishes.store(count, Ordering::Release);
    }

    /// Close the publishing channel with an error on the next `count`
    /// publishes.
    pub fn close_channel_on_next_publishes(&self, count: usize) {
        self.state.closing_publishes.store(count, Ordering::Release);
    }

    /// Fail the next `count` channel opens with a channel error. The
    /// connection stays open.
    pub fn fail_next_channel_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::Release);
    }

    pub fn refuse_dials(&self, refuse: bool) {
        self.state.refuse_dials.store(refuse, Ordering::Release);
    }

    /// Stop delivering from `queue` once it is empty. Consume streams end
    /// without a channel close.
    pub fn close_queue(&self, queue: &str) {
        self.state.declare(queue).close();
    }

    // Observation

    pub fn channels_opened(&self) -> u64 {
        self.state.stats.channels_opened.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.state.stats.published.load(Ordering::Relaxed)
    }

    /// Published messages dropped because their queue did not exist.
    pub fn unroutable(&self) -> u64 {
        self.state.stats.unroutable.load(Ordering::Relaxed)
    }

    pub fn acks(&self) -> u64 {
        self.state.stats.acks.load(Ordering::Relaxed)
    }

    pub fn rejects(&self) -> u64 {
        self.state.stats.rejects.load(Ordering::Relaxed)
    }

    pub fn requeues(&self) -> u64 {
        self.state.stats.requeues.load(Ordering::Relaxed)
    }

    /// Resolutions in the order they happened, keyed by message id.
    pub fn resolutions(&self) -> Vec<(String, Resolution)> {
        lock(&self.state.resolutions).clone()
    }

    /// Prefetch requested by the most recent `set_prefetch` call.
    pub fn last_prefetch(&self) -> usize {
        self.state.last_prefetch.load(Ordering::Relaxed)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.queue(queue).is_some()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.has_topic(topic)
    }

    /// Names of the queues bound to `topic`, in binding order.
    pub fn bindings(&self, topic: &str) -> Vec<String> {
        lock(&self.state.topics)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .queue(queue)
            .map(|q| lock(&q.messages).len())
            .unwrap_or(0)
    }

    /// Snapshot of the messages waiting in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .queue(queue)
            .map(|q| lock(&q.messages).iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn dial(&self, address: &str) -> Result<MemoryConnection, BrokerError> {
        if self.state.refuse_dials.load(Ordering::Acquire) {
            return Err(BrokerError::connection(format!("connection refused: {address}")));
        }

        let connection = Arc::new(ConnectionState::default());
        lock(&self.state.connections).push(Arc::downgrade(&connection));
        debug!(address, "Memory connection dialed");

        Ok(MemoryConnection {
            broker: Arc::clone(&self.state),
            state: connection,
        })
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: Arc<BrokerState>,
    state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, BrokerError> {
        if self.state.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        if take_one(&self.broker.failing_opens) {
            return Err(BrokerError::channel_closed("simulated channel open failure"));
        }

        let channel = Arc::new(ChannelState {
            id: self.broker.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1,
            ..ChannelState::default()
        });
        lock(&self.state.channels).push(Arc::downgrade(&channel));
        self.broker
            .stats
            .channels_opened
            .fetch_add(1, Ordering::Relaxed);

        Ok(MemoryChannel {
            broker: Arc::clone(&self.broker),
            connection: Arc::clone(&self.state),
            state: channel,
            next_tag: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn topic_exists(&self, name: &str) -> Result<bool, BrokerError> {
        if self.state.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(self.broker.has_topic(name))
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, BrokerError> {
        if self.state.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(self.broker.queue(name).is_some())
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.close(None);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    state: Arc<ChannelState>,
    next_tag: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.connection.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        Ok(())
    }

    /// Close the channel with a `NOT_FOUND` cause, as AMQP does.
    fn not_found(&self, what: &str, name: &str) -> BrokerError {
        let cause = format!("NOT_FOUND - no {what} '{name}'");
        self.state.close(Some(cause.clone()));
        BrokerError::channel_closed(cause)
    }

    fn inject_publish_fault(&self) -> Result<(), BrokerError> {
        if take_one(&self.broker.closing_publishes) {
            self.state.close(Some("simulated channel failure".to_string()));
            return Err(self.state.closed_error());
        }
        if take_one(&self.broker.failing_publishes) {
            return Err(BrokerError::transport("simulated publish failure"));
        }
        Ok(())
    }
}

fn stored(message_id: &str, message: &OutboundMessage) -> StoredMessage {
    StoredMessage {
        message_id: message_id.to_string(),
        body: message.body.clone(),
        attributes: message.attributes.clone(),
        content_type: message.content_type.clone(),
        persistent: message.persistent,
        redelivered: false,
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare(name);
        Ok(())
    }

    async fn declare_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_topic(name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, topic: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.broker.queue(queue).is_none() {
            return Err(self.not_found("queue", queue));
        }

        let topic_found = match lock(&self.broker.topics).get_mut(topic) {
            Some(bound) => {
                if !bound.iter().any(|name| name == queue) {
                    bound.push(queue.to_string());
                }
                true
            }
            None => false,
        };
        if !topic_found {
            return Err(self.not_found("exchange", topic));
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .last_prefetch
            .store(usize::from(count), Ordering::Relaxed);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let Some(queue) = self.broker.queue(queue) else {
            return Err(self.not_found("queue", queue));
        };
        debug!(consumer_tag, channel_id = self.state.id, "Memory consumer started");

        let source = ConsumeSource {
            broker: Arc::clone(&self.broker),
            queue,
            channel: Arc::clone(&self.state),
            next_tag: Arc::clone(&self.next_tag),
        };
        Ok(stream::unfold(source, |source| async move {
            let delivery = source.next_delivery().await?;
            Some((Ok(delivery), source))
        })
        .boxed())
    }

    async fn publish(
        &self,
        destination: &str,
        message: OutboundMessage,
    ) -> Result<String, BrokerError> {
        self.ensure_open()?;
        self.inject_publish_fault()?;

        let message_id = self.broker.next_message_id();
        match self.broker.queue(destination) {
            Some(queue) => queue.push_back(stored(&message_id, &message)),
            None => {
                self.broker.stats.unroutable.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.broker.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(message_id)
    }

    async fn publish_to_topic(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let Some(queues) = self.broker.bound_queues(topic) else {
            return Err(self.not_found("exchange", topic));
        };
        self.inject_publish_fault()?;

        let message_id = self.broker.next_message_id();
        if queues.is_empty() {
            self.broker.stats.unroutable.fetch_add(1, Ordering::Relaxed);
        }
        for queue in &queues {
            queue.push_back(stored(&message_id, &message));
        }
        self.broker.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(message_id)
    }

    fn notify_close(&self) -> CloseNotification {
        self.state.signal.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed() || self.connection.is_closed()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.close(None);
        Ok(())
    }
}

struct ConsumeSource {
    broker: Arc<BrokerState>,
    queue: Arc<MemoryQueue>,
    channel: Arc<ChannelState>,
    next_tag: Arc<AtomicU64>,
}

impl ConsumeSource {
    /// Next message, or `None` once the channel or the drained queue closes.
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            // Register before checking so a push between check and wait is seen.
            let channel_closed = self.channel.notify.notified();
            let queue_changed = self.queue.notify.notified();

            if self.channel.is_closed() {
                return None;
            }
            if let Some(message) = self.queue.pop() {
                return Some(self.to_delivery(message));
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }

            tokio::select! {
                _ = channel_closed => {}
                _ = queue_changed => {}
            }
        }
    }

    fn to_delivery(&self, message: StoredMessage) -> Delivery {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let redelivered = message.redelivered;
        let payload = message.body.clone();
        let attributes = message.attributes.clone();

        let acker = MemoryAcker {
            broker: Arc::clone(&self.broker),
            queue: Arc::clone(&self.queue),
            message,
            resolved: AtomicBool::new(false),
        };
        Delivery::new(payload, attributes, acker)
            .with_delivery_id(tag.to_string())
            .with_redelivered(redelivered)
    }
}

struct MemoryAcker {
    broker: Arc<BrokerState>,
    queue: Arc<MemoryQueue>,
    message: StoredMessage,
    resolved: AtomicBool,
}

impl MemoryAcker {
    fn resolve_once(&self, resolution: Resolution) -> Result<(), BrokerError> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::transport(format!(
                "message {} already resolved",
                self.message.message_id
            )));
        }
        lock(&self.broker.resolutions).push((self.message.message_id.clone(), resolution));
        Ok(())
    }
}

#[async_trait]
impl CompletionHandle for MemoryAcker {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.resolve_once(Resolution::Acked)?;
        self.broker.stats.acks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.resolve_once(Resolution::Rejected { requeue })?;
        self.broker.stats.rejects.fetch_add(1, Ordering::Relaxed);
        if requeue {
            self.broker.stats.requeues.fetch_add(1, Ordering::Relaxed);
            self.queue.push_front(StoredMessage {
                redelivered: true,
                ..self.message.clone()
            });
        }
        Ok(())
    }
}
