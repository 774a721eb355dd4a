//! Topic and subscription tests against the in-memory broker

use broker_worker::memory::MemoryConnection;
use broker_worker::{BrokerError, Client, MemoryBroker, NoOpHandler, handler_fn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::{assert_eventually, within};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(broker: &MemoryBroker) -> (Client<MemoryConnection>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = Client::connect(broker, "memory://topic-tests", shutdown_rx)
        .await
        .unwrap();
    (client, shutdown_tx)
}

#[tokio::test]
async fn test_create_topic_is_idempotent() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;

    client.create_topic("orders").await.unwrap();
    client.create_topic("orders").await.unwrap();

    assert!(broker.has_topic("orders"));
    assert!(matches!(
        client.create_topic("").await,
        Err(BrokerError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_create_subscription_binds_once() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;
    client.create_topic("orders").await.unwrap();

    client.create_subscription("billing", "orders").await.unwrap();
    client.create_subscription("billing", "orders").await.unwrap();

    assert!(broker.has_queue("billing"));
    assert_eq!(broker.bindings("orders"), vec!["billing"]);
}

#[tokio::test]
async fn test_subscription_requires_topic() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;

    let err = client.create_subscription("billing", "orders").await.unwrap_err();

    assert!(matches!(err, BrokerError::NotFound(_)));
    assert_eq!(err.to_string(), "not found: topic orders");
    assert!(!broker.has_queue("billing"));
}

#[tokio::test]
async fn test_publisher_and_subscriber_require_existing_names() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;

    assert!(matches!(
        client.new_publisher("orders").await.err().unwrap(),
        BrokerError::NotFound(_)
    ));
    assert!(matches!(
        client.new_subscriber("w", "billing", NoOpHandler).await.err().unwrap(),
        BrokerError::NotFound(_)
    ));
    assert!(!broker.has_topic("orders"));
    assert!(!broker.has_queue("billing"));
}

#[tokio::test]
async fn test_topic_fans_out_to_every_subscription() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;
    client.create_topic("orders").await.unwrap();
    client.create_subscription("billing", "orders").await.unwrap();
    client.create_subscription("shipping", "orders").await.unwrap();

    let publisher = client.new_publisher("orders").await.unwrap();
    let attributes = HashMap::from([("tenant".to_string(), "acme".to_string())]);
    let message_id = publisher
        .publish_with_attributes(&json!({"id": 7}), attributes.clone())
        .await
        .unwrap();

    for subscription in ["billing", "shipping"] {
        let stored = broker.messages(subscription);
        assert_eq!(stored.len(), 1, "{subscription}");
        assert_eq!(stored[0].message_id, message_id);
        assert_eq!(stored[0].attributes, attributes);
    }
    assert_eq!(publisher.topic(), "orders");
    assert!(!broker.has_queue("orders"));
}

#[tokio::test]
async fn test_stopped_publisher_rejects_publishes() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;
    client.create_topic("orders").await.unwrap();
    let publisher = client.new_publisher("orders").await.unwrap();

    publisher.stop().await.unwrap();
    publisher.stop().await.unwrap();

    assert!(matches!(
        publisher.publish(&json!({"id": 1})).await,
        Err(BrokerError::ProducerClosed)
    ));
}

#[tokio::test]
async fn test_publisher_reopens_channel_once() {
    let broker = MemoryBroker::new();
    let (client, _shutdown) = connect(&broker).await;
    client.create_topic("orders").await.unwrap();
    client.create_subscription("billing", "orders").await.unwrap();
    let publisher = client.new_publisher("orders").await.unwrap();

    broker.close_channels(Some("CHANNEL_ERROR"));
    publisher.publish(&json!({"id": 1})).await.unwrap();

    assert_eq!(publisher.reconnect_count(), 1);
    assert_eq!(broker.queue_len("billing"), 1);
}

#[tokio::test]
async fn test_subscriber_consumes_published_messages() {
    let broker = MemoryBroker::new();
    let (client, shutdown) = connect(&broker).await;
    client.create_topic("orders").await.unwrap();
    client.create_subscription("billing", "orders").await.unwrap();

    let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |payload, _attributes| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(serde_json::from_slice(&payload)?);
            Ok(())
        }
    });
    let subscriber = client
        .new_subscriber("billing-worker", "billing", handler)
        .await
        .unwrap();
    assert!(!subscriber.config().declare_queue);
    let run = tokio::spawn(subscriber.consume(2));

    let publisher = client.new_publisher("orders").await.unwrap();
    for id in 0..3 {
        publisher.publish(&json!({ "id": id })).await.unwrap();
    }

    assert_eventually(WAIT, "subscription drained", || broker.acks() == 3).await;
    shutdown.send(true).unwrap();
    within(WAIT, "subscriber stop", run).await.unwrap().unwrap();
    assert_eq!(received.lock().unwrap().len(), 3);
}
