use thiserror::Error;

use simbridge_core::BridgeError;

use crate::canonical::CanonicalJsonError;
use crate::store::StoreError;

/// Audit sink errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Store(#[from] StoreError),

    /// A previous write failed; the sink refuses further writes.
    #[error("audit sink halted after write failure: {0}")]
    Halted(String),

    #[error("{operation} is not supported by audit backend {backend}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    #[error("canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalJsonError),

    #[error("audit chain integrity violation: {0}")]
    Integrity(String),
}

impl From<AuditError> for BridgeError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Unsupported { .. } => BridgeError::Unsupported(err.to_string()),
            AuditError::Integrity(_) => BridgeError::IntegrityViolation(err.to_string()),
            AuditError::Store(_) | AuditError::Halted(_) | AuditError::Canonical(_) => {
                BridgeError::Internal(err.to_string())
            }
        }
    }
}
