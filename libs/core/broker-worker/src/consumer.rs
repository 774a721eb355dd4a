//! Bounded-concurrency consumption engine.
//!
//! The engine pulls deliveries from a [`DeliveryStream`], admits each one
//! into a [`WorkerPool`], runs the handler on its own task and resolves the
//! delivery from the handler's outcome.
//!
//! # Termination
//!
//! The engine stops admitting work when the channel close notification fires,
//! the shutdown signal is set, or the stream ends. It then always drains:
//! every admitted delivery runs to completion and is resolved before
//! [`ConsumptionEngine::run`] returns.
//!
//! | Trigger                          | Result                      |
//! |----------------------------------|-----------------------------|
//! | shutdown signal                  | `Ok(())`                    |
//! | clean channel close              | `Ok(())`                    |
//! | channel closed with an error     | `Err(ChannelClosed)`        |
//! | stream ended without a close     | `Err(DeliveryStreamClosed)` |
//! | stream yielded an error          | `Err(that error)`           |

use crate::config::ConsumerConfig;
use crate::delivery::{Delivery, Outcome};
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::metrics::ConsumerMetrics;
use crate::pool::{ConcurrencyToken, WorkerPool};
use crate::shutdown::cancelled;
use crate::transport::{Channel, CloseNotification, Connection, DeliveryStream};
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// How long to wait for a close notification after the stream ends.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of a consumption engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Draining,
    /// Terminal. `faulted` is set when the engine stopped with an error.
    Stopped { faulted: bool },
}


impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Created => "created",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
            EngineState::Stopped { faulted: false } => "stopped",
            EngineState::Stopped { faulted: true } => "faulted",
        };
        f.write_str(s)
    }
}

/// Why the dispatch loop stopped.
#[derive(Debug)]
enum Termination {
    Cancelled,
    Closed(Option<BrokerError>),
    StreamEnded,
    StreamFailed(BrokerError),
}

impl Termination {
    fn from_notification(
        notification: Result<Option<BrokerError>, oneshot::error::RecvError>,
    ) -> Self {
        // A dropped sender is a clean close.
        Termination::Closed(notification.unwrap_or(None))
    }

    fn into_result(self) -> Result<(), BrokerError> {
        match self {
            Termination::Cancelled | Termination::Closed(None) => Ok(()),
            Termination::Closed(Some(err @ BrokerError::ChannelClosed(_))) => Err(err),
            Termination::Closed(Some(cause)) => Err(BrokerError::channel_closed(cause.to_string())),
            Termination::StreamEnded => Err(BrokerError::DeliveryStreamClosed),
            Termination::StreamFailed(err) => Err(err),
        }
    }
}

/// Runs a handler over a delivery stream with bounded concurrency.
pub struct ConsumptionEngine<H> {
    consumer_name: String,
    handler: Arc<H>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<EngineState>,
    metrics: ConsumerMetrics,
}

impl<H: Handler> ConsumptionEngine<H> {
    /// Create an engine for `handler`. Setting `shutdown` to `true` stops it.
    pub fn new(
        consumer_name: impl Into<String>,
        queue_name: impl Into<String>,
        handler: H,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        let metrics = ConsumerMetrics::new(queue_name, handler.name());
        Self {
            consumer_name: consumer_name.into(),
            handler: Arc::new(handler),
            shutdown,
            state,
            metrics,
        }
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Consume `deliveries` until a termination signal, then drain.
    ///
    /// `closed` is the close notification of the channel backing the stream.
    /// Returns `InvalidArgument` without touching the stream when
    /// `concurrency` is zero.
    pub async fn run(
        self,
        mut deliveries: DeliveryStream,
        mut closed: CloseNotification,
        concurrency: usize,
    ) -> Result<(), BrokerError> {
        let pool = WorkerPool::new(concurrency)?;
        let mut shutdown = self.shutdown.clone();
        let mut tasks: JoinSet<()> = JoinSet::new();

        self.state.send_replace(EngineState::Running);
        info!(
            consumer = %self.consumer_name,
            handler = self.handler.name(),
            concurrency,
            "Consumer started, waiting for deliveries"
        );

        let termination = loop {
            tokio::select! {
                biased;

                notification = &mut closed => break Termination::from_notification(notification),

                _ = cancelled(&mut shutdown) => break Termination::Cancelled,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined);
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.metrics.delivery_received();

                        if delivery.is_empty() {
                            self.skip_empty(delivery).await;
                            continue;
                        }

                        let token = tokio::select! {
                            biased;
                            notification = &mut closed => {
                                Self::return_unadmitted(delivery).await;
                                break Termination::from_notification(notification);
                            }
                            _ = cancelled(&mut shutdown) => {
                                Self::return_unadmitted(delivery).await;
                                break Termination::Cancelled;
                            }
                            token = pool.acquire() => token,
                        };

                        self.metrics.in_flight(pool.in_flight());
                        tasks.spawn(dispatch(
                            Arc::clone(&self.handler),
                            delivery,
                            token,
                            pool.clone(),
                            self.metrics.clone(),
                        ));
                    }
                    Some(Err(err)) => break Termination::StreamFailed(err),
                    None => {
                        break match tokio::time::timeout(CLOSE_GRACE, &mut closed).await {
                            Ok(notification) => Termination::from_notification(notification),
                            Err(_) => Termination::StreamEnded,
                        };
                    }
                },
            }
        };

        self.log_termination(&termination);

        self.state.send_replace(EngineState::Draining);
        info!(
            consumer = %self.consumer_name,
            in_flight = tasks.len(),
            "Draining in-flight deliveries"
        );
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }
        self.metrics.in_flight(0);

        let result = termination.into_result();
        self.state.send_replace(EngineState::Stopped {
            faulted: result.is_err(),
        });
        info!(consumer = %self.consumer_name, faulted = result.is_err(), "Consumer stopped");
        result
    }

    async fn skip_empty(&self, delivery: Delivery) {
        debug!(
            consumer = %self.consumer_name,
            delivery_id = %delivery.delivery_id(),
            "Acknowledging empty payload"
        );
        self.metrics.empty_payload();
        match delivery.ack().await {
            Ok(()) => self.metrics.acked(),
            Err(e) => warn!(error = %e, "Failed to acknowledge empty payload"),
        }
    }

    /// Requeue a delivery that was read but never admitted.
    async fn return_unadmitted(delivery: Delivery) {
        let delivery_id = delivery.delivery_id().to_string();
        if let Err(e) = delivery.reject(true).await {
            warn!(delivery_id = %delivery_id, error = %e, "Failed to requeue unadmitted delivery");
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            error!(
                consumer = %self.consumer_name,
                error = %e,
                "Dispatch task failed outside the handler"
            );
        }
    }

    fn log_termination(&self, termination: &Termination) {
        let consumer = &self.consumer_name;
        match termination {
            Termination::Cancelled => info!(consumer = %consumer, "Shutdown signal received"),
            Termination::Closed(None) => info!(consumer = %consumer, "Channel closed"),
            Termination::Closed(Some(cause)) => {
                error!(consumer = %consumer, error = %cause, "Channel closed with error")
            }
            Termination::StreamEnded => {
                error!(consumer = %consumer, "Delivery stream ended without a close notification")
            }
            Termination::StreamFailed(e) => {
                error!(consumer = %consumer, error = %e, "Delivery stream failed")
            }
        }
    }
}

/// Run the handler for one admitted delivery and resolve it.
async fn dispatch<H: Handler>(
    handler: Arc<H>,
    delivery: Delivery,
    token: ConcurrencyToken,
    pool: WorkerPool,
    metrics: ConsumerMetrics,
) {
    let started = Instant::now();
    let result = AssertUnwindSafe(handler.handle_message(delivery.payload(), delivery.attributes()))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(e)) => {
            warn!(
                handler = handler.name(),
                delivery_id = %delivery.delivery_id(),
                error = %e,
                "Handler failed, requeueing"
            );
            Outcome::Failure(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                handler = handler.name(),
                delivery_id = %delivery.delivery_id(),
                panic = %message,
                "Handler panicked, requeueing"
            );
            metrics.handler_panicked();
            Outcome::Failure(format!("handler panicked: {message}"))
        }
    };
    metrics.handled(outcome.label(), started.elapsed());

    let delivery_id = delivery.delivery_id().to_string();
    match delivery.resolve(&outcome).await {
        Ok(()) if outcome.is_success() => metrics.acked(),
        Ok(()) => metrics.rejected(),
        Err(e) => error!(delivery_id = %delivery_id, error = %e, "Failed to resolve delivery"),
    }

    drop(token);
    metrics.in_flight(pool.in_flight());
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Consumes one queue over a fresh channel.
///
/// Declares the queue, sets the channel prefetch to the concurrency limit,
/// then runs a [`ConsumptionEngine`]. The channel is closed on return.
pub struct QueueConsumer<C, H> {
    connection: Arc<C>,
    config: ConsumerConfig,
    engine: ConsumptionEngine<H>,
}

impl<C: Connection, H: Handler> QueueConsumer<C, H> {
    pub fn new(
        connection: Arc<C>,
        config: ConsumerConfig,
        handler: H,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let engine = ConsumptionEngine::new(
            config.consumer_name.clone(),
            config.queue_name.clone(),
            handler,
            shutdown,
        );
        Self {
            connection,
            config,
            engine,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Subscribe to engine state transitions.
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.engine.state()
    }

    /// Consume until shutdown or channel loss. Consumes `self`, so a
    /// consumer runs at most once.
    pub async fn consume(self, concurrency: usize) -> Result<(), BrokerError> {
        if concurrency == 0 {
            return Err(BrokerError::invalid("concurrency must be greater than 0"));
        }

        let Self {
            connection,
            config,
            engine,
        } = self;

        let channel = connection.open_channel().await?;
        let closed = channel.notify_close();

        let result: Result<(), BrokerError> = async {
            if config.declare_queue {
                channel.declare_queue(&config.queue_name).await?;
            }
            channel
                .set_prefetch(config.effective_prefetch(concurrency))
                .await?;
            let deliveries = channel
                .consume(&config.queue_name, &config.consumer_name)
                .await?;

            info!(
                consumer = %config.consumer_name,
                queue = %config.queue_name,
                "Consuming queue"
            );
            engine.run(deliveries, closed, concurrency).await
        }
        .await;

        if !channel.is_closed() {
            if let Err(e) = channel.close().await {
                warn!(consumer = %config.consumer_name, error = %e, "Failed to close consumer channel");
            }
        }

        result
    }
}
