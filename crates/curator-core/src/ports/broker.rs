//! Broker port: durable at-least-once message queue.
//!
//! A message stays in flight until the consumer finishes or requeues it,
//! or until its visibility timeout lapses without a `touch`. Handlers that
//! hand a message to background stages must call `disable_auto_response`
//! so the consumer loop leaves the response to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("message {0} is no longer in flight")]
    NotInFlight(MessageId),

    #[error("broker closed")]
    Closed,
}

/// One delivery of a message.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    fn id(&self) -> MessageId;

    fn body(&self) -> &str;

    /// Delivery count, 1 on first delivery.
    fn attempts(&self) -> u16;

    /// Acknowledge; the message will not be delivered again.
    async fn finish(&self) -> Result<(), BrokerError>;

    /// Return to the queue, invisible for `delay`.
    async fn requeue(&self, delay: Duration) -> Result<(), BrokerError>;

    /// Extend the visibility timeout.
    async fn touch(&self) -> Result<(), BrokerError>;

    fn disable_auto_response(&self);

    fn auto_response_disabled(&self) -> bool;

    /// Whether `finish` or `requeue` already ran for this delivery.
    fn has_responded(&self) -> bool;
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn enqueue(&self, topic: &str, body: &str) -> Result<(), BrokerError>;

    /// Waits for the next message on `topic` for consumer group `channel`.
    /// Returns `None` once the broker is closed.
    async fn receive(&self, topic: &str, channel: &str) -> Option<Arc<dyn QueueMessage>>;
}

/// Per-message callback run by the consumer loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), crate::error::CuratorError>;
}
