use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Span, error, info, instrument, warn};

use nomflow_events::retry::{last_error, next_attempt, retry_count};
use nomflow_events::{Delivery, Message, MessageBroker};

use crate::dead_letter::DeadLetterPublisher;
use crate::stages::{StageError, StageHandler};
use crate::workers::RouteConfig;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Processed,
    /// Republished on the retry topic with this attempt number.
    Requeued { attempt: u32 },
    Quarantined,
    /// The retry or dead-letter publish failed; the delivery must be handled again.
    Deferred,
    /// Shutdown arrived during the backoff; the delivery must not be acknowledged.
    Interrupted,
}

impl HandleOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, HandleOutcome::Deferred | HandleOutcome::Interrupted)
    }
}

/// Wraps a stage with the retry envelope, the fixed backoff and quarantine.
///
/// Every stage failure becomes a requeue or a quarantine decision; nothing is
/// returned to the router.
#[derive(Clone)]
pub struct RetryAwareHandler {
    route: RouteConfig,
    stage: Arc<dyn StageHandler>,
    broker: Arc<dyn MessageBroker>,
    dead_letters: DeadLetterPublisher,
}

impl RetryAwareHandler {
    pub fn new(
        route: RouteConfig,
        stage: Arc<dyn StageHandler>,
        broker: Arc<dyn MessageBroker>,
        dead_letters: DeadLetterPublisher,
    ) -> Self {
        Self {
            route,
            stage,
            broker,
            dead_letters,
        }
    }

    pub fn route(&self) -> &RouteConfig {
        &self.route
    }

    #[instrument(
        skip_all,
        fields(
            topic = %delivery.topic,
            stage = self.stage.kind().name(),
            delivery_id = %delivery.id,
            retry_count
        )
    )]
    pub async fn handle(&self, delivery: &Delivery, shutdown: &CancellationToken) -> HandleOutcome {
        let message = &delivery.message;
        let attempt = retry_count(&message.headers);
        Span::current().record("retry_count", attempt);

        if attempt > self.route.max_retries {
            let error = last_error(&message.headers).to_string();
            return self.quarantine(&error, message).await;
        }

        if attempt > 0 {
            tokio::select! {
                _ = tokio::time::sleep(self.route.backoff) => {}
                _ = shutdown.cancelled() => {
                    info!("shutdown during backoff; delivery left unacknowledged");
                    return HandleOutcome::Interrupted;
                }
            }
        }

        match self.run_stage(message).await {
            Ok(()) => HandleOutcome::Processed,
            Err(e) if e.is_fatal() => self.quarantine(&e.to_string(), message).await,
            Err(e) => {
                let error = e.to_string();
                let retry = next_attempt(message, &error);
                let next = retry_count(&retry.headers);
                warn!(error = %error, next_attempt = next, "stage failed; requeueing");

                match self.broker.publish(&self.route.retry_topic, retry).await {
                    Ok(()) => HandleOutcome::Requeued { attempt: next },
                    Err(publish_err) => {
                        error!(
                            retry_topic = %self.route.retry_topic,
                            error = %publish_err,
                            "failed to publish retry message; delivery left unacknowledged"
                        );
                        HandleOutcome::Deferred
                    }
                }
            }
        }
    }

    /// Run the stage on its own task so a panic surfaces as a retryable failure.
    async fn run_stage(&self, message: &Message) -> Result<(), StageError> {
        let stage = Arc::clone(&self.stage);
        let message = message.clone();
        match tokio::spawn(async move { stage.handle(&message).await }).await {
            Ok(result) => result,
            Err(e) => Err(StageError::Panicked(e.to_string())),
        }
    }

    async fn quarantine(&self, error: &str, message: &Message) -> HandleOutcome {
        match self
            .dead_letters
            .publish(&self.route.retry_topic, error, message)
            .await
        {
            Ok(_) => HandleOutcome::Quarantined,
            Err(e) => {
                error!(error = %e, "failed to publish to dead-letter queue; delivery left unacknowledged");
                HandleOutcome::Deferred
            }
        }
    }
}
