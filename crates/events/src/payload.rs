//! JSON bodies of the pipeline topics.

use serde::{Deserialize, Serialize};

use nomflow_core::UploadId;

/// Relational-upsert stage output: how the upload was split and how its records fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAnalysis {
    pub upload_id: UploadId,
    pub scope: String,
    pub total_dgraph_batches: i32,
    #[serde(default)]
    pub records_succeeded: i64,
    #[serde(default)]
    pub records_failed: i64,
}

/// The relational stage committed every record of the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalStageCompletion {
    pub upload_id: UploadId,
    pub scope: String,
    pub success: bool,
    pub total_dgraph_batches: i32,
    #[serde(default)]
    pub records_succeeded: i64,
    #[serde(default)]
    pub records_failed: i64,
}

/// One graph batch was ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphBatchCompletion {
    pub upload_id: UploadId,
    pub scope: String,
    pub success: bool,
    /// Index of the batch within the upload; lets redeliveries be recognised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<i32>,
}

/// Mail request consumed by the notification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub mail_subject: String,
    pub mail_message: String,
    pub mail_to: Vec<String>,
}
