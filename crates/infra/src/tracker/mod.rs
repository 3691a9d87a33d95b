//! Batch completion tracking.
//!
//! Every operation is a single atomic write against the request row and returns the
//! row as it is after the write. Callers never read, modify and write back; they
//! inspect the returned row with [`UploadRequest::is_complete`] and finalize through
//! [`BatchCompletionTracker::finalize`], a compare-and-set on `status`.
//!
//! ## Error Mapping
//!
//! | Situation | TrackerError | Retryable |
//! |-----------|--------------|-----------|
//! | No row for the upload id | `NotFound` | yes (registration may not be visible yet) |
//! | Total smaller than the completed count | `Domain(InvariantViolation)` | yes |
//! | Connection / query failure | `Storage` | yes |

mod in_memory;
mod postgres;

pub use in_memory::InMemoryTracker;
pub use postgres::PostgresTracker;

use async_trait::async_trait;

use nomflow_core::{
    DomainError, FileOutcome, RecordCounts, RequestId, RequestStatus, UploadId, UploadRequest,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error("upload request not found: {0}")]
    NotFound(UploadId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Storage of upload-request progress.
#[async_trait]
pub trait BatchCompletionTracker: Send + Sync {
    async fn get(&self, upload_id: &UploadId) -> Result<UploadRequest, TrackerError>;

    /// Relational-upsert stage: batch count and record outcomes, `postgres_success` untouched.
    async fn record_upload_analysis(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError>;

    /// Relational stage finished: batch count, record outcomes, `postgres_success = true`.
    async fn record_relational_stage_completion(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError>;

    /// One graph batch was ingested.
    ///
    /// Counted at most once per distinct `batch` index, and never past a known total;
    /// an ignored signal returns the unchanged row.
    async fn record_graph_stage_batch_success(
        &self,
        upload_id: &UploadId,
        batch: Option<i32>,
    ) -> Result<UploadRequest, TrackerError>;

    async fn list_file_outcomes(
        &self,
        request_id: RequestId,
        scope: &str,
    ) -> Result<Vec<FileOutcome>, TrackerError>;

    /// Set a terminal status if the request is still `PENDING`.
    ///
    /// Returns `true` only for the call that performed the transition.
    async fn finalize(
        &self,
        request_id: RequestId,
        status: RequestStatus,
    ) -> Result<bool, TrackerError>;
}

#[async_trait]
impl<T> BatchCompletionTracker for std::sync::Arc<T>
where
    T: BatchCompletionTracker + ?Sized,
{
    async fn get(&self, upload_id: &UploadId) -> Result<UploadRequest, TrackerError> {
        (**self).get(upload_id).await
    }

    async fn record_upload_analysis(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError> {
        (**self).record_upload_analysis(upload_id, total_batches, records).await
    }

    async fn record_relational_stage_completion(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError> {
        (**self)
            .record_relational_stage_completion(upload_id, total_batches, records)
            .await
    }

    async fn record_graph_stage_batch_success(
        &self,
        upload_id: &UploadId,
        batch: Option<i32>,
    ) -> Result<UploadRequest, TrackerError> {
        (**self).record_graph_stage_batch_success(upload_id, batch).await
    }

    async fn list_file_outcomes(
        &self,
        request_id: RequestId,
        scope: &str,
    ) -> Result<Vec<FileOutcome>, TrackerError> {
        (**self).list_file_outcomes(request_id, scope).await
    }

    async fn finalize(
        &self,
        request_id: RequestId,
        status: RequestStatus,
    ) -> Result<bool, TrackerError> {
        (**self).finalize(request_id, status).await
    }
}
