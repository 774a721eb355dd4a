//! Inbound deliveries and their completion handles.

use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Capability to resolve one inbound message.
///
/// Transports hand one handle out per message. The consumer resolves each
/// handle exactly once, either by acknowledging or by rejecting it.
///
/// Completions may be issued out of order once more than one delivery is in
/// flight. Transports whose protocol requires in-order acknowledgment must
/// serialize internally.
#[async_trait]
pub trait CompletionHandle: Send + Sync {
    /// Mark the message as processed.
    async fn acknowledge(&self) -> Result<(), BrokerError>;

    /// Mark the message as not processed, optionally returning it to the queue.
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure(_) => "failure",
        }
    }
}

impl<E: fmt::Display> From<&Result<(), E>> for Outcome {
    fn from(result: &Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Failure(e.to_string()),
        }
    }
}

/// One inbound message plus its completion handle.
///
/// Resolution methods take `self`, so a delivery can only be resolved once.
pub struct Delivery {
    payload: Vec<u8>,
    attributes: HashMap<String, String>,
    delivery_id: String,
    redelivered: bool,
    completion: Box<dyn CompletionHandle>,
}

impl Delivery {
    /// Create a new delivery.
    pub fn new(
        payload: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
        completion: impl CompletionHandle + 'static,
    ) -> Self {
        Self {
            payload: payload.into(),
            attributes,
            delivery_id: String::new(),
            redelivered: false,
            completion: Box::new(completion),
        }
    }

    /// Set the transport-assigned delivery identifier.
    pub fn with_delivery_id(mut self, id: impl Into<String>) -> Self {
        self.delivery_id = id.into();
        self
    }

    /// Mark the delivery as a redelivery.
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Empty payloads are keepalives and never reach a handler.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.completion.acknowledge().await
    }

    /// Reject the delivery.
    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.completion.reject(requeue).await
    }

    /// Acknowledge on success, reject with requeue on failure.
    pub async fn resolve(self, outcome: &Outcome) -> Result<(), BrokerError> {
        match outcome {
            Outcome::Success => self.ack().await,
            Outcome::Failure(_) => self.reject(true).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_id", &self.delivery_id)
            .field("payload_len", &self.payload.len())
            .field("attributes", &self.attributes)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl CompletionHandle for Recorder {
        async fn acknowledge(&self) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push("ack".to_string());
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push(format!("reject:{requeue}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolve_success_acks() {
        let recorder = Recorder::default();
        let delivery = Delivery::new(b"{}".to_vec(), HashMap::new(), recorder.clone());

        delivery.resolve(&Outcome::Success).await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_resolve_failure_requeues() {
        let recorder = Recorder::default();
        let delivery = Delivery::new(b"{}".to_vec(), HashMap::new(), recorder.clone());

        delivery
            .resolve(&Outcome::Failure("boom".to_string()))
            .await
            .unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec!["reject:true"]);
    }

    #[test]
    fn test_accessors() {
        let attributes = HashMap::from([("tenant".to_string(), "acme".to_string())]);
        let delivery = Delivery::new(Vec::new(), attributes, Recorder::default())
            .with_delivery_id("7")
            .with_redelivered(true);

        assert!(delivery.is_empty());
        assert!(delivery.is_redelivered());
        assert_eq!(delivery.delivery_id(), "7");
        assert_eq!(delivery.attributes()["tenant"], "acme");
        assert!(format!("{delivery:?}").contains("payload_len: 0"));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<(), String> = Ok(());
        let err: Result<(), String> = Err("bad".to_string());

        assert_eq!(Outcome::from(&ok), Outcome::Success);
        assert_eq!(Outcome::from(&err), Outcome::Failure("bad".to_string()));
        assert_eq!(Outcome::from(&err).label(), "failure");
    }
}
