//! Consumer and producer configuration.

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name, also used as the broker consumer tag
    pub consumer_name: String,

    /// Queue to consume from
    pub queue_name: String,

    /// Prefetch override; defaults to the concurrency limit
    pub prefetch: Option<u16>,

    /// Declare the queue (durable) before consuming
    pub declare_queue: bool,
}

impl ConsumerConfig {
    /// Create a configuration for `queue_name` consumed as `consumer_name`.
    pub fn new(consumer_name: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            queue_name: queue_name.into(),
            prefetch: None,
            declare_queue: true,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_declare_queue(mut self, declare: bool) -> Self {
        self.declare_queue = declare;
        self
    }

    /// Prefetch to request for a given concurrency limit.
    pub fn effective_prefetch(&self, concurrency: usize) -> u16 {
        self.prefetch
            .unwrap_or_else(|| u16::try_from(concurrency).unwrap_or(u16::MAX))
    }
}

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Content type stamped on every message
    pub content_type: String,

    /// Mark messages persistent
    pub persistent: bool,

    /// Declare the destination queue before each publish
    pub declare_destination: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            persistent: true,
            declare_destination: true,
        }
    }
}

impl ProducerConfig {
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_declare_destination(mut self, declare: bool) -> Self {
        self.declare_destination = declare;
        self
    }
}
