//! Tracked state of one nominative-user upload request.
//!
//! Two stages report progress against the same row independently:
//!
//! - the **relational stage** learns how many graph batches the upload was split
//!   into and marks the relational upsert as successful;
//! - the **graph stage** reports each ingested batch, one at a time.
//!
//! The signals are unordered. Whichever arrives last observes the completion
//! condition and finalizes the request. The transition methods below are the
//! single place where the row invariants are enforced for in-process stores;
//! the Postgres tracker encodes the same guards in its SQL.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{RequestId, UploadId};
use crate::outcome::RecordCounts;

/// Lifecycle status of an upload request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[default]
    Pending,
    Success,
    Partial,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Partial => "PARTIAL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "SUCCESS" => Ok(RequestStatus::Success),
            "PARTIAL" => Ok(RequestStatus::Partial),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// One row of `nominative_user_requests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub request_id: RequestId,
    pub upload_id: UploadId,
    pub scope: String,
    /// Unknown until the relational stage reports how the upload was batched.
    pub total_dgraph_batches: Option<i32>,
    pub dgraph_completed_batches: i32,
    pub postgres_success: bool,
    pub status: RequestStatus,
    pub records: RecordCounts,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRequest {
    /// A freshly registered request: nothing reported yet.
    pub fn registered(
        request_id: RequestId,
        upload_id: UploadId,
        scope: impl Into<String>,
        created_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            upload_id,
            scope: scope.into(),
            total_dgraph_batches: None,
            dgraph_completed_batches: 0,
            postgres_success: false,
            status: RequestStatus::Pending,
            records: RecordCounts::default(),
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Both stages are done: every graph batch is in and the relational upsert succeeded.
    pub fn is_complete(&self) -> bool {
        self.postgres_success
            && self
                .total_dgraph_batches
                .is_some_and(|total| self.dgraph_completed_batches == total)
    }

    /// Record the batch count and record outcomes reported by the relational stage.
    ///
    /// Idempotent: applying the same analysis twice leaves the row unchanged.
    pub fn apply_analysis(&mut self, total_batches: i32, records: RecordCounts) -> DomainResult<()> {
        self.check_total(total_batches)?;
        self.total_dgraph_batches = Some(total_batches);
        self.records = records;
        self.touch();
        Ok(())
    }

    /// Record that the relational stage finished (sets the batch count as well).
    pub fn apply_relational_completion(
        &mut self,
        total_batches: i32,
        records: RecordCounts,
    ) -> DomainResult<()> {
        self.apply_analysis(total_batches, records)?;
        self.postgres_success = true;
        Ok(())
    }

    /// Count one ingested graph batch.
    ///
    /// Returns `false` (and changes nothing) when the known total is already reached.
    pub fn apply_graph_batch(&mut self) -> bool {
        if let Some(total) = self.total_dgraph_batches {
            if self.dgraph_completed_batches >= total {
                return false;
            }
        }
        self.dgraph_completed_batches += 1;
        self.touch();
        true
    }

    /// Move a pending request to its terminal status.
    ///
    /// Returns `false` if the request was already final; the status never changes twice.
    pub fn finalize(&mut self, status: RequestStatus) -> DomainResult<bool> {
        if !status.is_terminal() {
            return Err(DomainError::validation("cannot finalize to PENDING"));
        }
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.status = status;
        self.touch();
        Ok(true)
    }

    fn check_total(&self, total_batches: i32) -> DomainResult<()> {
        if total_batches < 0 {
            return Err(DomainError::validation(format!(
                "total_dgraph_batches must be >= 0, got {total_batches}"
            )));
        }
        if total_batches < self.dgraph_completed_batches {
            return Err(DomainError::invariant(format!(
                "upload {}: total_dgraph_batches {} < dgraph_completed_batches {}",
                self.upload_id, total_batches, self.dgraph_completed_batches
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
