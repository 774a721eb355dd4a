//! Message handler for the relay worker.

use broker_worker::{Connection, Handler, HandlerError, Producer, async_trait};
use std::collections::HashMap;
use tracing::{info, warn};

/// Republishing target
struct Relay<C: Connection> {
    producer: Producer<C>,
    queue: String,
}

/// Logs every message and, when configured, republishes it to a relay queue.
///
/// Relayed payloads must be JSON; anything else fails the delivery and it is
/// requeued.
pub struct RelayHandler<C: Connection> {
    relay: Option<Relay<C>>,
}

impl<C: Connection> RelayHandler<C> {
    /// Only log messages.
    pub fn logging() -> Self {
        Self { relay: None }
    }

    /// Log messages and republish them to `queue` with their attributes.
    pub fn relaying(producer: Producer<C>, queue: impl Into<String>) -> Self {
        Self {
            relay: Some(Relay {
                producer,
                queue: queue.into(),
            }),
        }
    }

    pub fn relay_queue(&self) -> Option<&str> {
        self.relay.as_ref().map(|r| r.queue.as_str())
    }

    /// Close the relay producer, if any.
    pub async fn close(&self) {
        let Some(relay) = &self.relay else {
            return;
        };
        if let Err(e) = relay.producer.close().await {
            warn!(error = %e, "Failed to close relay producer");
        }
    }
}

#[async_trait]
impl<C: Connection> Handler for RelayHandler<C> {
    async fn handle_message(
        &self,
        payload: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        info!(bytes = payload.len(), attributes = attributes.len(), "Message received");

        let Some(relay) = &self.relay else {
            return Ok(());
        };

        let body: serde_json::Value = serde_json::from_slice(payload)?;
        let message_id = relay
            .producer
            .publish_with_attributes(&relay.queue, &body, attributes.clone())
            .await
            .map_err(|e| HandlerError::failed_with_source("relay publish failed", e))?;

        info!(queue = %relay.queue, message_id = %message_id, "Message relayed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "relay_handler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_worker::MemoryBroker;
    use broker_worker::memory::MemoryConnection;
    use broker_worker::{BrokerError, Client};
    use tokio::sync::watch;

    async fn client(broker: &MemoryBroker) -> (Client<MemoryConnection>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let client = Client::connect(broker, "memory://relay", rx).await.unwrap();
        (client, tx)
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_anything() {
        let handler = RelayHandler::<MemoryConnection>::logging();

        let result = handler.handle_message(b"not json", &HashMap::new()).await;

        assert!(result.is_ok());
        assert_eq!(handler.relay_queue(), None);
        assert_eq!(handler.name(), "relay_handler");
    }

    #[tokio::test]
    async fn test_relaying_handler_republishes_with_attributes() {
        let broker = MemoryBroker::new();
        let (client, _tx) = client(&broker).await;
        let handler = RelayHandler::relaying(client.new_producer().await.unwrap(), "audit");
        let attributes = HashMap::from([("tenant".to_string(), "acme".to_string())]);

        handler
            .handle_message(br#"{"id":42}"#, &attributes)
            .await
            .unwrap();

        let stored = broker.messages("audit");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].attributes, attributes);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&stored[0].body).unwrap(),
            serde_json::json!({"id": 42})
        );
    }

    #[tokio::test]
    async fn test_relaying_handler_rejects_invalid_json() {
        let broker = MemoryBroker::new();
        let (client, _tx) = client(&broker).await;
        let handler = RelayHandler::relaying(client.new_producer().await.unwrap(), "audit");

        let err = handler
            .handle_message(b"{oops", &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::InvalidPayload(_)));
        assert_eq!(broker.published(), 0);
    }

    #[tokio::test]
    async fn test_relay_failure_fails_delivery() {
        let broker = MemoryBroker::new();
        let (client, _tx) = client(&broker).await;
        let handler = RelayHandler::relaying(client.new_producer().await.unwrap(), "audit");
        broker.drop_connections();

        let err = handler
            .handle_message(b"{}", &HashMap::new())
            .await
            .unwrap_err();

        let source = std::error::Error::source(&err)
            .and_then(|s| s.downcast_ref::<BrokerError>())
            .unwrap();
        assert!(matches!(source, BrokerError::ConnectionClosed));
    }
}
