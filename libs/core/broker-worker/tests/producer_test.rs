//! Producer tests against the in-memory broker

use broker_worker::memory::MemoryConnection;
use broker_worker::{BrokerError, Client, MemoryBroker, Producer};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use test_utils::TestDataBuilder;
use tokio::sync::watch;

struct Setup {
    broker: MemoryBroker,
    client: Client<MemoryConnection>,
    producer: Producer<MemoryConnection>,
    _shutdown: watch::Sender<bool>,
}

async fn setup() -> Setup {
    let broker = MemoryBroker::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = Client::connect(&broker, "memory://producer-tests", shutdown_rx)
        .await
        .unwrap();
    let producer = client.new_producer().await.unwrap();
    Setup {
        broker,
        client,
        producer,
        _shutdown: shutdown_tx,
    }
}

#[derive(Serialize)]
struct OrderCreated {
    order_id: u64,
    total_cents: i64,
}

#[tokio::test]
async fn test_publish_stores_persistent_json() {
    let s = setup().await;
    let queue = TestDataBuilder::from_test_name("publish_json").queue_name("orders");

    let message_id = s
        .producer
        .publish(&queue, &OrderCreated { order_id: 7, total_cents: 1250 })
        .await
        .unwrap();

    let stored = s.broker.messages(&queue);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message_id, message_id);
    assert_eq!(stored[0].content_type, "application/json");
    assert!(stored[0].persistent);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&stored[0].body).unwrap(),
        json!({"order_id": 7, "total_cents": 1250})
    );
}

#[tokio::test]
async fn test_publish_with_attributes_sets_headers() {
    let s = setup().await;
    let attributes = HashMap::from([
        ("tenant".to_string(), "acme".to_string()),
        ("source".to_string(), "billing".to_string()),
    ]);

    s.producer
        .publish_with_attributes("invoices", &json!({"id": 1}), attributes.clone())
        .await
        .unwrap();

    assert_eq!(s.broker.messages("invoices")[0].attributes, attributes);
}

#[tokio::test]
async fn test_blank_destination_rejected() {
    let s = setup().await;

    let err = s.producer.publish("   ", &json!({"id": 1})).await.unwrap_err();

    assert!(matches!(err, BrokerError::EmptyDestination));
    assert_eq!(s.broker.published(), 0);
}

#[tokio::test]
async fn test_null_body_rejected() {
    let s = setup().await;
    let body: Option<OrderCreated> = None;

    let err = s.producer.publish("orders", &body).await.unwrap_err();

    assert!(matches!(err, BrokerError::EmptyBody));
    assert_eq!(s.broker.published(), 0);
}

#[tokio::test]
async fn test_closed_channel_reopened_once() {
    let s = setup().await;
    assert_eq!(s.broker.channels_opened(), 1);

    s.broker.close_channels(Some("PRECONDITION_FAILED - unknown delivery tag"));
    s.producer.publish("orders", &json!({"n": 1})).await.unwrap();

    assert_eq!(s.broker.channels_opened(), 2);
    assert_eq!(s.producer.reconnect_count(), 1);

    // The fresh channel is reused.
    s.producer.publish("orders", &json!({"n": 2})).await.unwrap();
    assert_eq!(s.broker.channels_opened(), 2);
    assert_eq!(s.broker.queue_len("orders"), 2);
}

#[tokio::test]
async fn test_channel_closing_mid_publish_retried_once() {
    let s = setup().await;
    s.broker.close_channel_on_next_publishes(1);

    s.producer.publish("orders", &json!({"n": 1})).await.unwrap();

    assert_eq!(s.broker.channels_opened(), 2);
    assert_eq!(s.producer.reconnect_count(), 1);
    assert_eq!(s.broker.queue_len("orders"), 1);
}

#[tokio::test]
async fn test_second_failure_after_retry_surfaces_transport_error() {
    let s = setup().await;
    s.broker.close_channel_on_next_publishes(2);

    let err = s.producer.publish("orders", &json!({"n": 1})).await.unwrap_err();

    assert!(matches!(err, BrokerError::Transport(_)), "got {err:?}");
    assert_eq!(s.broker.channels_opened(), 2, "exactly one reconnection");
    assert_eq!(s.producer.reconnect_count(), 1);
}

#[tokio::test]
async fn test_send_failure_on_open_channel_not_retried() {
    let s = setup().await;
    s.broker.fail_next_publishes(1);

    let err = s.producer.publish("orders", &json!({"n": 1})).await.unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));
    assert_eq!(s.broker.channels_opened(), 1);

    s.producer.publish("orders", &json!({"n": 2})).await.unwrap();
    assert_eq!(s.broker.queue_len("orders"), 1);
}

#[tokio::test]
async fn test_closed_connection_fails_fast_without_reconnect() {
    let s = setup().await;

    s.broker.drop_connections();
    let err = s.producer.publish("orders", &json!({"n": 1})).await.unwrap_err();

    assert!(matches!(err, BrokerError::ConnectionClosed));
    assert!(!err.is_retryable());
    assert_eq!(s.broker.channels_opened(), 1, "no reconnection attempted");
    assert_eq!(s.producer.reconnect_count(), 0);
    assert!(s.client.is_closed());
}

#[tokio::test]
async fn test_concurrent_publishes_share_one_reconnect() {
    let s = setup().await;
    s.broker.close_channels(None);

    let producer = &s.producer;
    let publishes = (0..10).map(|n| async move {
        let body = json!({ "n": n });
        producer.publish("orders", &body).await
    });
    let results = join_all(publishes).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(s.broker.channels_opened(), 2);
    assert_eq!(s.broker.queue_len("orders"), 10);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let s = setup().await;

    s.producer.close().await.unwrap();
    s.producer.close().await.unwrap();

    assert!(s.producer.is_closed());
    let err = s.producer.publish("orders", &json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::ProducerClosed));
}
