use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use nomflow_events::{BrokerError, InMemoryBroker, Message, MessageBroker, Subscription};

/// In-memory broker whose publishes to matching topics fail while `failing` is set.
pub struct FlakyBroker {
    pub inner: InMemoryBroker,
    failing: AtomicBool,
    fails_on: fn(&str) -> bool,
}

impl FlakyBroker {
    pub fn failing_on(fails_on: fn(&str) -> bool) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryBroker::new(),
            failing: AtomicBool::new(true),
            fails_on,
        })
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::SeqCst) && (self.fails_on)(topic) {
            return Err(BrokerError::Connection(format!("{topic} unavailable")));
        }
        self.inner.publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        self.inner.subscribe(topic, group).await
    }
}
