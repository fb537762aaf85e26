use std::time::Duration;

use async_trait::async_trait;
use fc_common::{BrokerMessage, PublishReceipt, QueueMessage};

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "nats")]
pub mod nats;

#[cfg(feature = "activemq")]
pub mod activemq;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Approximate queue depth, for health monitoring.
#[derive(Debug, Clone, Default)]
pub struct QueueDepth {
    /// Messages visible and waiting to be fetched.
    pub pending: u64,
    /// Messages leased out (invisible).
    pub invisible: u64,
    pub queue_id: String,
}

/// Publishing side of a broker backend.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    /// Publish one message. Broker-side deduplication is reported through
    /// the receipt, not as an error.
    async fn publish(&self, message: QueueMessage) -> Result<PublishReceipt>;
}

/// Consuming side of a broker backend.
///
/// Bodies are opaque strings here; envelope parsing and poison handling
/// belong to the consumer loop.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Long-poll for up to `max_messages`, blocking at most `poll_timeout`.
    /// Returns an empty batch on timeout.
    async fn fetch(&self, max_messages: u32, poll_timeout: Duration) -> Result<Vec<BrokerMessage>>;

    /// Remove a leased message. Callers treat failures as retriable on the
    /// next redelivery of the same broker message id.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return a leased message to the queue after `delay_seconds` (clamped
    /// to the shared visibility range).
    async fn nack_with_delay(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()>;

    /// Reset the invisibility timer without removing the message.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Approximate pending/invisible counts, when the backend supports it.
    async fn query_metrics(&self) -> Result<Option<QueueDepth>> {
        Ok(None)
    }

    fn is_healthy(&self) -> bool;

    async fn stop(&self);
}

/// Combined publisher/consumer for the embedded backend.
#[async_trait]
pub trait EmbeddedQueue: QueueConsumer + QueuePublisher {
    async fn init_schema(&self) -> Result<()>;
}
