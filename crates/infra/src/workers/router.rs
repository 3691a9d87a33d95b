use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nomflow_events::{BrokerError, MessageBroker, Subscription};

use crate::dead_letter::DeadLetterPublisher;
use crate::stages::StageHandler;
use crate::workers::{HandleOutcome, RetryAwareHandler, RouteConfig};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owns one worker task per subscribed topic.
///
/// - Each worker receives, handles and acknowledges one delivery at a time,
///   so ordering holds within a topic
/// - Workers share nothing but the broker handle and the stage's storage
/// - A delivery whose retry or dead-letter publish failed is handled again after
///   the route's backoff, never acknowledged unresolved
/// - Stage panics become retryable failures inside the handler
pub struct TopicRouter {
    broker: Arc<dyn MessageBroker>,
    group: String,
    poll_interval: Duration,
    routes: Vec<RetryAwareHandler>,
}

impl TopicRouter {
    pub fn new(broker: Arc<dyn MessageBroker>, group: impl Into<String>) -> Self {
        Self {
            broker,
            group: group.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            routes: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bind `stage` to `route.topic`.
    pub fn route(mut self, route: RouteConfig, stage: Arc<dyn StageHandler>) -> Self {
        let dead_letters = DeadLetterPublisher::new(self.broker.clone());
        self.routes.push(RetryAwareHandler::new(
            route,
            stage,
            self.broker.clone(),
            dead_letters,
        ));
        self
    }

    pub fn topics(&self) -> Vec<&str> {
        self.routes.iter().map(|h| h.route().topic.as_str()).collect()
    }

    /// Subscribe every route, then spawn the workers.
    ///
    /// Subscriptions are made up front so a broker failure surfaces before any
    /// worker starts. Workers stop once `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<RouterHandle, BrokerError> {
        let mut subscriptions = Vec::with_capacity(self.routes.len());
        for handler in self.routes {
            let sub = self
                .broker
                .subscribe(&handler.route().topic, &self.group)
                .await?;
            subscriptions.push((handler, sub));
        }

        let mut workers = JoinSet::new();
        for (handler, sub) in subscriptions {
            info!(topic = %handler.route().topic, group = %self.group, "starting topic worker");
            workers.spawn(worker_loop(sub, handler, shutdown.clone(), self.poll_interval));
        }

        Ok(RouterHandle { shutdown, workers })
    }
}

/// Handle to stop and join the router's workers.
#[derive(Debug)]
pub struct RouterHandle {
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl RouterHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for every worker to stop.
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "topic worker panicked");
                } else {
                    warn!(error = %e, "topic worker aborted");
                }
            }
        }
        info!("all topic workers stopped");
    }
}

async fn worker_loop(
    mut sub: Box<dyn Subscription>,
    handler: RetryAwareHandler,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    let topic = sub.topic().to_string();

    while !shutdown.is_cancelled() {
        match sub.recv_timeout(poll_interval).await {
            Ok(Some(delivery)) => {
                let mut outcome = handler.handle(&delivery, &shutdown).await;
                while outcome == HandleOutcome::Deferred {
                    warn!(topic = %topic, delivery_id = %delivery.id, "delivery unresolved; handling again after backoff");
                    let resumed = tokio::select! {
                        _ = tokio::time::sleep(handler.route().backoff) => true,
                        _ = shutdown.cancelled() => false,
                    };
                    if !resumed {
                        break;
                    }
                    outcome = handler.handle(&delivery, &shutdown).await;
                }
                debug!(topic = %topic, delivery_id = %delivery.id, outcome = ?outcome, "delivery handled");

                if !outcome.should_ack() {
                    break;
                }
                if let Err(e) = sub.ack(&delivery).await {
                    warn!(topic = %topic, delivery_id = %delivery.id, error = %e, "ack failed");
                }
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(topic = %topic, error = %e, "receive failed");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }
    }

    info!(topic = %topic, "topic worker stopped");
}
