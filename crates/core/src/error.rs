//! Caller-facing error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used at the bridge boundary.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Closed error taxonomy surfaced by the scheduler, the idempotency gate and
/// the audit trail.
///
/// Every lower-level error (registry, audit store, execution backend) is mapped
/// into exactly one of these variants at the boundary where it leaves its layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Unknown job, record or handler.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency key reused with a different request fingerprint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A deadline was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A retryable backend failure.
    #[error("transient backend failure: {0}")]
    TransientBackendFailure(String),

    /// A non-retryable failure.
    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    /// The operation was cancelled on request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The audit chain failed verification.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The backend does not support the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The request was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage or audit infrastructure failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classification used in persisted job errors and wire responses.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::Conflict(_) => ErrorKind::Conflict,
            BridgeError::Timeout(_) => ErrorKind::Timeout,
            BridgeError::TransientBackendFailure(_) => ErrorKind::TransientBackendFailure,
            BridgeError::PermanentFailure(_) => ErrorKind::PermanentFailure,
            BridgeError::Cancelled(_) => ErrorKind::Cancelled,
            BridgeError::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            BridgeError::Unsupported(_) => ErrorKind::Unsupported,
            BridgeError::InvalidInput(_) => ErrorKind::InvalidInput,
            BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::TransientBackendFailure(_))
    }
}

/// Serializable error classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Timeout,
    TransientBackendFailure,
    PermanentFailure,
    Cancelled,
    IntegrityViolation,
    Unsupported,
    InvalidInput,
    Internal,
    /// The owning process died while the job was running.
    InterruptedByRestart,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientBackendFailure => "transient_backend_failure",
            ErrorKind::PermanentFailure => "permanent_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IntegrityViolation => "integrity_violation",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
            ErrorKind::InterruptedByRestart => "interrupted_by_restart",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(BridgeError::TransientBackendFailure("x".into()).is_retryable());
        assert!(!BridgeError::PermanentFailure("x".into()).is_retryable());
        assert!(!BridgeError::timeout("x").is_retryable());
        assert!(!BridgeError::Cancelled("x".into()).is_retryable());
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InterruptedByRestart).unwrap();
        assert_eq!(json, "\"interrupted_by_restart\"");
        assert_eq!(BridgeError::conflict("k").kind(), ErrorKind::Conflict);
    }
}
