//! `nomflow-core`: domain model for nominative-user import reconciliation.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the tracked upload request, its completion condition, and the rule that turns
//! per-file outcomes into a terminal status.

pub mod error;
pub mod id;
pub mod outcome;
pub mod upload;

pub use error::{DomainError, DomainResult};
pub use id::{RequestId, UploadId};
pub use outcome::{FileOutcome, RecordCounts, reconcile_status};
pub use upload::{RequestStatus, UploadRequest};
