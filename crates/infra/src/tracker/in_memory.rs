use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;

use nomflow_core::{
    FileOutcome, RecordCounts, RequestId, RequestStatus, UploadId, UploadRequest,
};

use super::{BatchCompletionTracker, TrackerError};

/// In-memory tracker for tests/dev.
///
/// A single write lock around each operation gives the same atomicity the Postgres
/// tracker gets from single-statement updates.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i32,
    requests: HashMap<UploadId, UploadRequest>,
    files: HashMap<(RequestId, String), Vec<FileOutcome>>,
    batch_acks: HashSet<(RequestId, i32)>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new pending request (done by the upload service in production).
    pub fn register(
        &self,
        upload_id: UploadId,
        scope: &str,
        created_by: Option<&str>,
    ) -> Result<UploadRequest, TrackerError> {
        let mut state = self.write()?;
        if let Some(existing) = state.requests.get(&upload_id) {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let request = UploadRequest::registered(
            RequestId::new(state.next_id),
            upload_id.clone(),
            scope,
            created_by.map(str::to_string),
        );
        state.requests.insert(upload_id, request.clone());
        Ok(request)
    }

    /// Attach a per-file outcome to a registered request.
    pub fn add_file_outcome(
        &self,
        request_id: RequestId,
        scope: &str,
        outcome: FileOutcome,
    ) -> Result<(), TrackerError> {
        let mut state = self.write()?;
        state
            .files
            .entry((request_id, scope.to_string()))
            .or_default()
            .push(outcome);
        Ok(())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, TrackerError> {
        self.state
            .write()
            .map_err(|_| TrackerError::Storage("tracker lock poisoned".to_string()))
    }

    fn update<F>(&self, upload_id: &UploadId, apply: F) -> Result<UploadRequest, TrackerError>
    where
        F: FnOnce(&mut UploadRequest) -> Result<(), TrackerError>,
    {
        let mut state = self.write()?;
        let request = state
            .requests
            .get_mut(upload_id)
            .ok_or_else(|| TrackerError::NotFound(upload_id.clone()))?;

        // Apply to a copy so a rejected change leaves the stored row untouched.
        let mut updated = request.clone();
        apply(&mut updated)?;
        *request = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl BatchCompletionTracker for InMemoryTracker {
    async fn get(&self, upload_id: &UploadId) -> Result<UploadRequest, TrackerError> {
        let state = self
            .state
            .read()
            .map_err(|_| TrackerError::Storage("tracker lock poisoned".to_string()))?;
        state
            .requests
            .get(upload_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(upload_id.clone()))
    }

    async fn record_upload_analysis(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError> {
        self.update(upload_id, |r| Ok(r.apply_analysis(total_batches, records)?))
    }

    async fn record_relational_stage_completion(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError> {
        self.update(upload_id, |r| {
            Ok(r.apply_relational_completion(total_batches, records)?)
        })
    }

    async fn record_graph_stage_batch_success(
        &self,
        upload_id: &UploadId,
        batch: Option<i32>,
    ) -> Result<UploadRequest, TrackerError> {
        let mut state = self.write()?;
        let State {
            requests,
            batch_acks,
            ..
        } = &mut *state;

        let request = requests
            .get_mut(upload_id)
            .ok_or_else(|| TrackerError::NotFound(upload_id.clone()))?;

        if let Some(index) = batch {
            if !batch_acks.insert((request.request_id, index)) {
                return Ok(request.clone());
            }
        }
        request.apply_graph_batch();
        Ok(request.clone())
    }

    async fn list_file_outcomes(
        &self,
        request_id: RequestId,
        scope: &str,
    ) -> Result<Vec<FileOutcome>, TrackerError> {
        let state = self
            .state
            .read()
            .map_err(|_| TrackerError::Storage("tracker lock poisoned".to_string()))?;
        Ok(state
            .files
            .get(&(request_id, scope.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn finalize(
        &self,
        request_id: RequestId,
        status: RequestStatus,
    ) -> Result<bool, TrackerError> {
        let mut state = self.write()?;
        match state
            .requests
            .values_mut()
            .find(|r| r.request_id == request_id)
        {
            Some(request) => Ok(request.finalize(status)?),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nomflow_core::DomainError;

    fn upload(id: &str) -> UploadId {
        UploadId::new(id).unwrap()
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let tracker = InMemoryTracker::new();
        let err = tracker
            .record_graph_stage_batch_success(&upload("missing"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn redelivered_batch_index_is_counted_once() {
        let tracker = InMemoryTracker::new();
        tracker.register(upload("U1"), "s", None).unwrap();

        tracker.record_graph_stage_batch_success(&upload("U1"), Some(0)).await.unwrap();
        let row = tracker
            .record_graph_stage_batch_success(&upload("U1"), Some(0))
            .await
            .unwrap();
        assert_eq!(row.dgraph_completed_batches, 1);

        let row = tracker
            .record_graph_stage_batch_success(&upload("U1"), Some(1))
            .await
            .unwrap();
        assert_eq!(row.dgraph_completed_batches, 2);
    }

    #[tokio::test]
    async fn rejected_total_leaves_row_unchanged() {
        let tracker = InMemoryTracker::new();
        tracker.register(upload("U1"), "s", None).unwrap();
        for _ in 0..3 {
            tracker.record_graph_stage_batch_success(&upload("U1"), None).await.unwrap();
        }

        let err = tracker
            .record_relational_stage_completion(&upload("U1"), 2, RecordCounts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Domain(DomainError::InvariantViolation(_))));

        let row = tracker.get(&upload("U1")).await.unwrap();
        assert_eq!(row.total_dgraph_batches, None);
        assert!(!row.postgres_success);
    }

    #[tokio::test]
    async fn finalize_is_a_compare_and_set() {
        let tracker = InMemoryTracker::new();
        let row = tracker.register(upload("U1"), "s", None).unwrap();

        assert!(tracker.finalize(row.request_id, RequestStatus::Success).await.unwrap());
        assert!(!tracker.finalize(row.request_id, RequestStatus::Partial).await.unwrap());
        assert_eq!(tracker.get(&upload("U1")).await.unwrap().status, RequestStatus::Success);
    }

    #[tokio::test]
    async fn file_outcomes_are_scoped() {
        let tracker = InMemoryTracker::new();
        let row = tracker.register(upload("U2"), "s1", None).unwrap();
        tracker
            .add_file_outcome(row.request_id, "s1", FileOutcome::new("a.csv", 1, 0))
            .unwrap();

        assert_eq!(tracker.list_file_outcomes(row.request_id, "s1").await.unwrap().len(), 1);
        assert!(tracker.list_file_outcomes(row.request_id, "s2").await.unwrap().is_empty());
    }
}
