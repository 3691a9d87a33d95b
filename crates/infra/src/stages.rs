//! Business functions bound to the pipeline topics.
//!
//! Each stage decodes its payload, applies one tracker write, then checks the
//! completion condition on the row the write returned. Whichever stage's write
//! completes the request finalizes it, and only the handler whose compare-and-set
//! transitions the row sends the notification.
//!
//! Stages are idempotent: replaying a message rewrites the same values (relational
//! stages), is recognised by its batch index (graph stage), or is stopped by the
//! `completed < total` guard.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use nomflow_core::{RecordCounts, UploadRequest};
use nomflow_events::topics;
use nomflow_events::{
    BrokerError, GraphBatchCompletion, Message, RelationalStageCompletion, UploadAnalysis,
};

use crate::notification::NotificationDispatcher;
use crate::reconciler::{Reconciliation, StatusReconciler};
use crate::tracker::{BatchCompletionTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("undecodable payload: {0}")]
    Decode(String),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Fatal errors can never succeed on retry and go straight to the dead-letter queue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Decode(_))
    }
}

/// The three consumed stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    UploadAnalysis,
    RelationalCompletion,
    GraphCompletion,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::UploadAnalysis,
        StageKind::RelationalCompletion,
        StageKind::GraphCompletion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::UploadAnalysis => "upload_analysis",
            StageKind::RelationalCompletion => "relational_completion",
            StageKind::GraphCompletion => "graph_completion",
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            StageKind::UploadAnalysis => topics::UPDATE_NOMINATIVE_USER_REQUEST,
            StageKind::RelationalCompletion => topics::PROCESS_NOM_POSTGRES_SUCCESS,
            StageKind::GraphCompletion => topics::PROCESS_NOM_DGRAPH_SUCCESS,
        }
    }

    pub fn retry_topic(&self) -> &'static str {
        match self {
            StageKind::UploadAnalysis => topics::UPDATE_NOMINATIVE_USER_REQUEST_RETRY,
            StageKind::RelationalCompletion => topics::PROCESS_NOM_POSTGRES_SUCCESS_RETRY,
            StageKind::GraphCompletion => topics::PROCESS_NOM_DGRAPH_SUCCESS_RETRY,
        }
    }
}

/// A business function invoked once per delivery.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn handle(&self, message: &Message) -> Result<(), StageError>;
}

/// Shared finalization path: reconcile, then notify on transition.
#[derive(Clone)]
pub struct Completion {
    reconciler: StatusReconciler,
    notifier: NotificationDispatcher,
}

impl Completion {
    pub fn new(reconciler: StatusReconciler, notifier: NotificationDispatcher) -> Self {
        Self {
            reconciler,
            notifier,
        }
    }

    pub async fn check(&self, request: &UploadRequest) -> Result<Reconciliation, TrackerError> {
        let outcome = self.reconciler.reconcile(request).await?;
        if let Reconciliation::Transitioned(status) = outcome {
            self.notifier.notify_completion(request, status).await;
        }
        Ok(outcome)
    }
}

fn decode<T: DeserializeOwned>(message: &Message) -> Result<T, StageError> {
    message.decode().map_err(|e| StageError::Decode(e.to_string()))
}

/// `update_nominative_user_request`: the relational upsert reports its batching.
pub struct UploadAnalysisStage {
    tracker: Arc<dyn BatchCompletionTracker>,
    completion: Completion,
}

impl UploadAnalysisStage {
    pub fn new(tracker: Arc<dyn BatchCompletionTracker>, completion: Completion) -> Self {
        Self {
            tracker,
            completion,
        }
    }
}

#[async_trait]
impl StageHandler for UploadAnalysisStage {
    fn kind(&self) -> StageKind {
        StageKind::UploadAnalysis
    }

    async fn handle(&self, message: &Message) -> Result<(), StageError> {
        let analysis: UploadAnalysis = decode(message)?;
        let row = self
            .tracker
            .record_upload_analysis(
                &analysis.upload_id,
                analysis.total_dgraph_batches,
                RecordCounts::new(analysis.records_succeeded, analysis.records_failed),
            )
            .await?;
        debug!(upload_id = %row.upload_id, total = analysis.total_dgraph_batches, "upload analysis recorded");

        self.completion.check(&row).await?;
        Ok(())
    }
}

/// `process_nom_postgres_success`: the relational stage finished.
pub struct RelationalCompletionStage {
    tracker: Arc<dyn BatchCompletionTracker>,
    completion: Completion,
}

impl RelationalCompletionStage {
    pub fn new(tracker: Arc<dyn BatchCompletionTracker>, completion: Completion) -> Self {
        Self {
            tracker,
            completion,
        }
    }
}

#[async_trait]
impl StageHandler for RelationalCompletionStage {
    fn kind(&self) -> StageKind {
        StageKind::RelationalCompletion
    }

    async fn handle(&self, message: &Message) -> Result<(), StageError> {
        let signal: RelationalStageCompletion = decode(message)?;
        if !signal.success {
            warn!(upload_id = %signal.upload_id, "relational stage reported failure; ignored");
            return Ok(());
        }

        let row = self
            .tracker
            .record_relational_stage_completion(
                &signal.upload_id,
                signal.total_dgraph_batches,
                RecordCounts::new(signal.records_succeeded, signal.records_failed),
            )
            .await?;
        debug!(upload_id = %row.upload_id, "relational stage completion recorded");

        self.completion.check(&row).await?;
        Ok(())
    }
}

/// `process_nom_dgraph_success`: one graph batch was ingested.
pub struct GraphCompletionStage {
    tracker: Arc<dyn BatchCompletionTracker>,
    completion: Completion,
}

impl GraphCompletionStage {
    pub fn new(tracker: Arc<dyn BatchCompletionTracker>, completion: Completion) -> Self {
        Self {
            tracker,
            completion,
        }
    }
}

#[async_trait]
impl StageHandler for GraphCompletionStage {
    fn kind(&self) -> StageKind {
        StageKind::GraphCompletion
    }

    async fn handle(&self, message: &Message) -> Result<(), StageError> {
        let signal: GraphBatchCompletion = decode(message)?;
        if !signal.success {
            warn!(upload_id = %signal.upload_id, batch = ?signal.batch, "graph batch reported failure; ignored");
            return Ok(());
        }

        let row = self
            .tracker
            .record_graph_stage_batch_success(&signal.upload_id, signal.batch)
            .await?;
        debug!(
            upload_id = %row.upload_id,
            completed = row.dgraph_completed_batches,
            total = ?row.total_dgraph_batches,
            "graph batch recorded"
        );

        self.completion.check(&row).await?;
        Ok(())
    }
}

/// One handler per stage, sharing a tracker and a completion path.
pub fn stage_handlers(
    tracker: Arc<dyn BatchCompletionTracker>,
    completion: Completion,
) -> Vec<Arc<dyn StageHandler>> {
    vec![
        Arc::new(UploadAnalysisStage::new(tracker.clone(), completion.clone())),
        Arc::new(RelationalCompletionStage::new(tracker.clone(), completion.clone())),
        Arc::new(GraphCompletionStage::new(tracker, completion)),
    ]
}
