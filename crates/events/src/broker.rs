//! Publish/consume abstraction (mechanics only).
//!
//! Delivery is **at-least-once**: a delivery that is never acknowledged is handed out
//! again the next time its consumer group subscribes. Consumers must be idempotent.
//!
//! ```ignore
//! let mut sub = broker.subscribe("process_nom_postgres_success", "nomflow").await?;
//!
//! loop {
//!     if let Some(delivery) = sub.recv_timeout(Duration::from_millis(100)).await? {
//!         handle(&delivery).await;
//!         sub.ack(&delivery).await?;
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{Delivery, Message};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("broker state lock poisoned")]
    Poisoned,
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

/// A consumer-group subscription to one topic.
///
/// A subscription is owned by a single worker; it is not shared across tasks.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing arrived.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Mark a delivery as handled so it is never redelivered to this group.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Transport-agnostic message broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError>;

    /// Join consumer group `group` on `topic` (created on first use).
    async fn subscribe(&self, topic: &str, group: &str)
    -> Result<Box<dyn Subscription>, BrokerError>;
}

#[async_trait]
impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        (**self).publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        (**self).subscribe(topic, group).await
    }
}
