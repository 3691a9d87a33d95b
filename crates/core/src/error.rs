//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, invariants, unknown identifiers).
/// Storage and broker failures are modelled in `nomflow-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. negative batch count).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A tracking invariant would be violated by the requested change.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was empty or malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status string did not name a known request status.
    #[error("unknown request status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
