use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EisenbahnError;
use crate::message::Message;

/// Fan-out side of PUB/SUB.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message. Subscribers filter by the message's topic.
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        (**self).publish(message).await
    }
}

/// Receiving side of PUB/SUB.
///
/// Subscriptions are topic prefixes; they should be in place before the
/// first `recv`, since `recv` holds the socket while it waits.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), EisenbahnError>;

    /// Wait for the next matching message.
    async fn recv(&self) -> Result<Message, EisenbahnError>;
}
