//! Infrastructure layer: storage, brokers, config and the consuming pipeline.

pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod notification;
pub mod reconciler;
pub mod stages;
pub mod tracker;
pub mod workers;

use std::sync::Arc;

use nomflow_events::MessageBroker;

use crate::config::WorkerConfig;
use crate::notification::NotificationDispatcher;
use crate::reconciler::StatusReconciler;
use crate::stages::{Completion, stage_handlers};
use crate::tracker::BatchCompletionTracker;
use crate::workers::TopicRouter;

/// Wire every configured route to its stage over the given tracker and broker.
pub fn build_router(
    config: &WorkerConfig,
    tracker: Arc<dyn BatchCompletionTracker>,
    broker: Arc<dyn MessageBroker>,
) -> TopicRouter {
    let completion = Completion::new(
        StatusReconciler::new(tracker.clone()),
        NotificationDispatcher::new(broker.clone()),
    );
    let handlers = stage_handlers(tracker, completion);

    let mut router = TopicRouter::new(broker, config.consumer_group.clone())
        .with_poll_interval(config.poll_interval);
    for route in config.routes() {
        if let Some(stage) = handlers.iter().find(|h| h.kind() == route.stage) {
            router = router.route(route, stage.clone());
        }
    }
    router
}
