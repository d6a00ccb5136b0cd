//! `simbridge-audit`: immutable, hash-chained audit trail.
//!
//! ## Components
//!
//! - `AuditEvent`: a sealed entry; its hash covers the canonical JSON of every
//!   other field, including the previous event's hash
//! - `AuditStore`: partitioned append-only storage (memory, local NDJSON files,
//!   write-once objects with retention locks)
//! - `AuditSink`: the single writer of the chain, plus event listing
//! - `verify_store`: read-only chain verification reporting the first failure

pub mod canonical;
pub mod error;
pub mod event;
pub mod redact;
pub mod sink;
pub mod store;
pub mod verify;

pub use error::AuditError;
pub use event::{partition_for, AuditEvent, ZERO_HASH};
pub use sink::{fetch_from_store, AuditSink, EventFilter};
pub use store::{AuditStore, StoreError};
pub use verify::{
    verify_store, FailureReason, IntegrityFailure, RetentionPolicy, VerifyRange, VerifyReport,
};
