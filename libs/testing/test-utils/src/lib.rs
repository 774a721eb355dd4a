//! Shared test utilities for broker tests
//!
//! This crate provides reusable test infrastructure:
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic queue, topic and consumer names (always available)
//! - `assertions`: Async assertion helpers (always available)
//!
//! # Features
//!
//! - `rabbitmq`: Enables RabbitMQ test infrastructure
//! - `all`: Enables all broker test infrastructure
//!
//! # Usage
//!
//! Add `features = ["rabbitmq"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["rabbitmq"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! async fn my_amqp_test() {
//!     let rabbit = TestRabbitMq::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_amqp_test");
//!
//!     let queue = builder.queue_name("orders");
//!     let client = Client::connect(&AmqpConnector::default(), rabbit.amqp_url(), shutdown).await?;
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic naming
///
/// Tests sharing one broker stay isolated by deriving every queue and
/// consumer name from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_publish_reconnects");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a unique name for testing
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(12345);
    /// assert_eq!(builder.name("queue", "orders"), "test-queue-12345-orders");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Queue name unique to this test
    pub fn queue_name(&self, suffix: &str) -> String {
        self.name("queue", suffix)
    }

    /// Topic name unique to this test
    pub fn topic_name(&self, suffix: &str) -> String {
        self.name("topic", suffix)
    }

    /// Consumer name unique to this test
    pub fn consumer_name(&self, suffix: &str) -> String {
        self.name("consumer", suffix)
    }

    /// Deterministic message id for the `index`-th message of this test
    pub fn message_id(&self, index: u64) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.seed.to_le_bytes());
        bytes[8..].copy_from_slice(&index.to_le_bytes());
        Uuid::from_bytes(bytes)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `condition` every 5ms until it holds, panicking after `timeout`.
    pub async fn assert_eventually<F>(timeout: Duration, context: &str, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let polled = tokio::time::timeout(timeout, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "{}: condition not met within {:?}", context, timeout);
    }

    /// Await `future`, panicking if it does not finish within `timeout`.
    pub async fn within<F: Future>(timeout: Duration, context: &str, future: F) -> F::Output {
        tokio::time::timeout(timeout, future)
            .await
            .unwrap_or_else(|_| panic!("{}: did not finish within {:?}", context, timeout))
    }
}
