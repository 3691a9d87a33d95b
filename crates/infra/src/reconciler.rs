//! Terminal status derivation and persistence.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use nomflow_core::{RequestStatus, UploadRequest, reconcile_status};

use crate::tracker::{BatchCompletionTracker, TrackerError};

/// Outcome of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The completion condition does not hold yet.
    Incomplete,
    /// Another handler already finalized the request.
    AlreadyFinal,
    /// This call moved the request from `PENDING` to the given status.
    Transitioned(RequestStatus),
}

#[derive(Clone)]
pub struct StatusReconciler {
    tracker: Arc<dyn BatchCompletionTracker>,
}

impl StatusReconciler {
    pub fn new(tracker: Arc<dyn BatchCompletionTracker>) -> Self {
        Self { tracker }
    }

    /// Finalize `request` if it is complete.
    ///
    /// Safe to call from every stage and on every redelivery: the compare-and-set
    /// lets exactly one caller observe [`Reconciliation::Transitioned`].
    #[instrument(skip(self, request), fields(upload_id = %request.upload_id), err)]
    pub async fn reconcile(&self, request: &UploadRequest) -> Result<Reconciliation, TrackerError> {
        if !request.is_complete() {
            debug!(
                completed = request.dgraph_completed_batches,
                total = ?request.total_dgraph_batches,
                postgres_success = request.postgres_success,
                "request not complete yet"
            );
            return Ok(Reconciliation::Incomplete);
        }
        if request.status.is_terminal() {
            return Ok(Reconciliation::AlreadyFinal);
        }

        let files = self
            .tracker
            .list_file_outcomes(request.request_id, &request.scope)
            .await?;
        let status = reconcile_status(request, &files);

        if self.tracker.finalize(request.request_id, status).await? {
            info!(status = %status, files = files.len(), "upload request finalized");
            Ok(Reconciliation::Transitioned(status))
        } else {
            Ok(Reconciliation::AlreadyFinal)
        }
    }
}
