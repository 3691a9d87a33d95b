//! Terminal quarantine for messages that will never be processed.

use std::sync::Arc;

use tracing::{instrument, warn};

use nomflow_events::topics::DEAD_LETTER_QUEUE;
use nomflow_events::{BrokerError, DeadLetterRecord, Message, MessageBroker};

/// Publishes [`DeadLetterRecord`]s to the dead-letter topic.
///
/// Nothing in this service consumes or retries that topic.
#[derive(Clone)]
pub struct DeadLetterPublisher {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl DeadLetterPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            topic: DEAD_LETTER_QUEUE.to_string(),
        }
    }

    /// Quarantine `original`, recording the topic it would have been retried on.
    #[instrument(skip(self, original), fields(dlq = %self.topic), err)]
    pub async fn publish(
        &self,
        topic_name: &str,
        error: &str,
        original: &Message,
    ) -> Result<DeadLetterRecord, BrokerError> {
        let record = DeadLetterRecord::new(topic_name, error, original);
        self.broker
            .publish(&self.topic, Message::json(&record)?)
            .await?;

        warn!(
            topic = %topic_name,
            error = %error,
            "message sent to dead-letter queue"
        );
        Ok(record)
    }
}
