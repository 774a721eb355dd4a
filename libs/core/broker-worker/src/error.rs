//! Broker error types and error classification
//!
//! Errors are classified to determine how callers react:
//! - **Validation**: Bad input or a missing topic/subscription, returned
//!   immediately and never retried
//! - **Transient**: Channel-level failure, recovered by reopening the channel
//! - **Fatal**: Connection-level failure, the connection must be rebuilt

use std::fmt;
use thiserror::Error;

/// Classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid input (empty destination, null body, zero concurrency)
    Validation,
    /// Channel closed or send failed; one reconnection may recover it
    Transient,
    /// Connection gone; a new client is required
    Fatal,
}

impl ErrorKind {
    /// Whether an in-process retry can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Label used for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by clients, consumers, producers and transports.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Argument failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Publish destination was blank
    #[error("destination cannot be empty")]
    EmptyDestination,

    /// Message body encoded to null
    #[error("message body cannot be null")]
    EmptyBody,

    /// Producer was closed by its owner
    #[error("producer has been closed")]
    ProducerClosed,

    /// Body could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Topic or subscription does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Dial failed or the dialed connection was unusable
    #[error("connection error: {0}")]
    Connection(String),

    /// Connection verified closed; not recoverable in-process
    #[error("connection is closed, a new client is required")]
    ConnectionClosed,

    /// Channel closed by the broker or the network
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Delivery stream ended without a close notification
    #[error("delivery stream closed unexpectedly")]
    DeliveryStreamClosed,

    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Create an invalid argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        BrokerError::InvalidArgument(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        BrokerError::Connection(message.into())
    }

    /// Create a channel closed error.
    pub fn channel_closed(message: impl Into<String>) -> Self {
        BrokerError::ChannelClosed(message.into())
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        BrokerError::NotFound(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        BrokerError::Transport(message.into())
    }

    /// Get the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::InvalidArgument(_)
            | BrokerError::EmptyDestination
            | BrokerError::EmptyBody
            | BrokerError::ProducerClosed
            | BrokerError::Serialization(_)
            | BrokerError::NotFound(_) => ErrorKind::Validation,
            BrokerError::ChannelClosed(_) | BrokerError::Transport(_) => ErrorKind::Transient,
            BrokerError::Connection(_)
            | BrokerError::ConnectionClosed
            | BrokerError::DeliveryStreamClosed => ErrorKind::Fatal,
        }
    }

    /// Check if this error may be resolved by reopening the channel.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}
