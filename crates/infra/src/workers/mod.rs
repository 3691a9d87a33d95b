//! Topic consumption: one worker per route, each wrapping a stage in retry handling.

mod retry_handler;
mod router;
#[cfg(test)]
mod test_support;

pub use retry_handler::{HandleOutcome, RetryAwareHandler};
pub use router::{RouterHandle, TopicRouter};

use std::time::Duration;

use crate::stages::StageKind;

/// One consumed topic and how its failures are retried.
///
/// A stage's main topic and its retry topic are two routes sharing the same
/// `retry_topic`, backoff and budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub stage: StageKind,
    pub topic: String,
    pub retry_topic: String,
    pub backoff: Duration,
    pub max_retries: u32,
}

impl RouteConfig {
    /// Route for the stage's main topic.
    pub fn for_stage(stage: StageKind, backoff: Duration, max_retries: u32) -> Self {
        Self {
            stage,
            topic: stage.topic().to_string(),
            retry_topic: stage.retry_topic().to_string(),
            backoff,
            max_retries,
        }
    }

    /// Route for the stage's retry topic.
    pub fn for_retry_topic(stage: StageKind, backoff: Duration, max_retries: u32) -> Self {
        Self {
            topic: stage.retry_topic().to_string(),
            ..Self::for_stage(stage, backoff, max_retries)
        }
    }
}
