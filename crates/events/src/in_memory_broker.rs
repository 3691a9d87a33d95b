//! In-memory broker for tests/dev.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::broker::{BrokerError, MessageBroker, Subscription};
use crate::message::{Delivery, Message};

/// In-memory broker with per-topic logs and consumer groups.
///
/// - Every topic is an append-only log; a new group starts reading at its beginning
/// - Each group tracks its read cursor and the deliveries it has not acknowledged yet
/// - Subscribing to an existing group requeues its unacknowledged deliveries
///   (the same recovery a restarted Redis Streams consumer performs)
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    published: Notify,
}

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<Message>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    next: usize,
    pending: BTreeSet<usize>,
    redeliver: VecDeque<usize>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message ever published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        match self.inner.topics.lock() {
            Ok(topics) => topics
                .get(topic)
                .map(|log| log.entries.clone())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Deliveries handed to `group` on `topic` and not acknowledged yet.
    pub fn unacked(&self, topic: &str, group: &str) -> usize {
        match self.inner.topics.lock() {
            Ok(topics) => topics
                .get(topic)
                .and_then(|log| log.groups.get(group))
                .map(|g| g.pending.len())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        {
            let mut topics = self.inner.topics.lock().map_err(|_| BrokerError::Poisoned)?;
            let log = topics.entry(topic.to_string()).or_default();
            log.entries.push(message);
            trace!(topic, offset = log.entries.len() - 1, "message published");
        }
        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        {
            let mut topics = self.inner.topics.lock().map_err(|_| BrokerError::Poisoned)?;
            let state = topics
                .entry(topic.to_string())
                .or_default()
                .groups
                .entry(group.to_string())
                .or_default();

            let GroupState { pending, redeliver, .. } = state;
            for idx in pending.iter() {
                if !redeliver.contains(idx) {
                    redeliver.push_back(*idx);
                }
            }
        }

        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }
}

#[derive(Debug)]
struct InMemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    group: String,
}

impl InMemorySubscription {
    fn try_next(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut topics = self.inner.topics.lock().map_err(|_| BrokerError::Poisoned)?;
        let Some(log) = topics.get_mut(&self.topic) else {
            return Ok(None);
        };
        let state = log.groups.entry(self.group.clone()).or_default();

        let idx = if let Some(idx) = state.redeliver.pop_front() {
            idx
        } else if state.next < log.entries.len() {
            state.next += 1;
            state.next - 1
        } else {
            return Ok(None);
        };
        state.pending.insert(idx);

        Ok(Some(Delivery {
            id: format!("{idx}-0"),
            topic: self.topic.clone(),
            message: log.entries[idx].clone(),
        }))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let published = self.inner.published.notified();
            if let Some(delivery) = self.try_next()? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let idx = delivery
            .id
            .split('-')
            .next()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| BrokerError::Command(format!("invalid delivery id: {}", delivery.id)))?;

        let mut topics = self.inner.topics.lock().map_err(|_| BrokerError::Poisoned)?;
        if let Some(state) = topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group))
        {
            state.pending.remove(&idx);
            state.redeliver.retain(|i| *i != idx);
        }
        Ok(())
    }
}
