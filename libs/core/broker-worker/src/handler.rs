//! Handler trait for message processing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a [`Handler`].
///
/// Every variant leads to the delivery being rejected with requeue.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing failed
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Payload could not be decoded
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl HandlerError {
    /// Create a failure without a source.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure with a source.
    pub fn failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Message handler trait.
///
/// Implementations must be thread-safe: `handle_message` is called
/// concurrently, up to the consumer's concurrency limit.
///
/// # Contract
///
/// * `Ok(())` - the delivery is acknowledged
/// * `Err(HandlerError)` - the delivery is rejected and requeued
///
/// A panic inside `handle_message` is caught by the consumer and treated
/// like an `Err`.
///
/// # Example
///
/// ```rust,ignore
/// use broker_worker::{Handler, HandlerError};
///
/// struct OrderHandler;
///
/// #[async_trait]
/// impl Handler for OrderHandler {
///     async fn handle_message(
///         &self,
///         payload: &[u8],
///         attributes: &HashMap<String, String>,
///     ) -> Result<(), HandlerError> {
///         let order: Order = serde_json::from_slice(payload)?;
///         process(order, attributes.get("tenant")).await
///             .map_err(|e| HandlerError::failed_with_source("order processing failed", e))
///     }
///
///     fn name(&self) -> &'static str {
///         "order_handler"
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one message payload with its attributes.
    async fn handle_message(
        &self,
        payload: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError>;

    /// Handler name used as a log and metrics label.
    fn name(&self) -> &'static str {
        "handler"
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle_message(
        &self,
        payload: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        (**self).handle_message(payload, attributes).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Handler backed by an async closure.
///
/// Created with [`handler_fn`]. The closure receives owned copies of the
/// payload and attributes.
pub struct FnHandler<F> {
    f: F,
    name: &'static str,
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<u8>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        name: "fn_handler",
    }
}

impl<F> FnHandler<F> {
    /// Set the handler name.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<u8>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_message(
        &self,
        payload: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        (self.f)(payload.to_vec(), attributes.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A handler that accepts every message.
#[derive(Debug, Clone, Default)]
pub struct NoOpHandler;

#[async_trait]
impl Handler for NoOpHandler {
    async fn handle_message(
        &self,
        _payload: &[u8],
        _attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop_handler"
    }
}

/// A handler that rejects every message.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    error_message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
        }
    }
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle_message(
        &self,
        _payload: &[u8],
        _attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::failed(&self.error_message))
    }

    fn name(&self) -> &'static str {
        "failing_handler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler;
        let result = handler.handle_message(b"{}", &HashMap::new()).await;

        assert!(result.is_ok());
        assert_eq!(handler.name(), "noop_handler");
    }

    #[tokio::test]
    async fn test_failing_handler() {
        let handler = FailingHandler::new("downstream unavailable");
        let err = handler
            .handle_message(b"{}", &HashMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "downstream unavailable");
    }

    #[tokio::test]
    async fn test_handler_fn_receives_payload_and_attributes() {
        let handler = handler_fn(|payload, attributes| async move {
            if payload == b"ping" && attributes.get("kind").map(String::as_str) == Some("health") {
                Ok(())
            } else {
                Err(HandlerError::failed("unexpected message"))
            }
        })
        .named("ping_handler");

        let attributes = HashMap::from([("kind".to_string(), "health".to_string())]);
        assert!(handler.handle_message(b"ping", &attributes).await.is_ok());
        assert!(handler.handle_message(b"pong", &attributes).await.is_err());
        assert_eq!(handler.name(), "ping_handler");
    }

    #[tokio::test]
    async fn test_arc_handler_delegates() {
        let handler: Arc<dyn Handler> = Arc::new(FailingHandler::new("nope"));

        assert!(handler.handle_message(b"x", &HashMap::new()).await.is_err());
        assert_eq!(Handler::name(&handler), "failing_handler");
    }

    #[test]
    fn test_invalid_payload_from_serde() {
        let err: HandlerError = serde_json::from_slice::<u32>(b"{").unwrap_err().into();
        assert!(err.to_string().starts_with("invalid payload"));
    }
}
