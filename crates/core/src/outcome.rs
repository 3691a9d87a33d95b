//! Record outcomes and the terminal-status rule.

use serde::{Deserialize, Serialize};

use crate::upload::{RequestStatus, UploadRequest};

/// Succeeded/failed record counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordCounts {
    pub succeeded: i64,
    pub failed: i64,
}

impl RecordCounts {
    pub fn new(succeeded: i64, failed: i64) -> Self {
        Self { succeeded, failed }
    }
}

/// Per-file record outcome of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub file_name: String,
    pub records: RecordCounts,
}

impl FileOutcome {
    pub fn new(file_name: impl Into<String>, succeeded: i64, failed: i64) -> Self {
        Self {
            file_name: file_name.into(),
            records: RecordCounts::new(succeeded, failed),
        }
    }
}

/// Terminal status for a completed request.
///
/// Any file with failed records makes the whole upload `PARTIAL`. When no file rows
/// exist the request's own aggregate counters decide.
pub fn reconcile_status(request: &UploadRequest, files: &[FileOutcome]) -> RequestStatus {
    let any_failed = if files.is_empty() {
        request.records.failed > 0
    } else {
        files.iter().any(|f| f.records.failed > 0)
    };

    if any_failed {
        RequestStatus::Partial
    } else {
        RequestStatus::Success
    }
}
