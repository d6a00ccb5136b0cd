//! Audit storage backends.
//!
//! An [`AuditStore`] persists sealed events into named partitions (one per UTC
//! day) and hands back the raw stored bytes for verification. Stores never
//! interpret or repair what they hold.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::AuditEvent;

pub mod local;
pub mod memory;
pub mod object;

pub use local::LocalFileStore;
pub use memory::MemoryAuditStore;
pub use object::{
    FsObjectStore, MemoryObjectStore, ObjectAuditStore, ObjectRetention, ObjectStore,
    RetentionLock, RetentionMode,
};

/// Audit storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(location: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            location: location.into(),
            source,
        }
    }
}

/// One stored entry as read back from a partition.
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// Zero-based position within the partition.
    pub offset: u64,
    /// Backend-specific location (file and line, or object key).
    pub locator: String,
    pub bytes: Vec<u8>,
    /// Object-level retention lock, for write-once backends.
    pub retention: Option<ObjectRetention>,
}

/// Append-only partitioned storage for audit events.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Human-readable backend description (used in logs and errors).
    fn describe(&self) -> String;

    /// Whether recent events can be listed cheaply.
    ///
    /// Write-once object backends return `false`; the sink then refuses
    /// `fetch_events` instead of returning an empty result.
    fn supports_random_access(&self) -> bool;

    /// Durably append `event` to `partition`.
    async fn append(&self, partition: &str, event: &AuditEvent) -> Result<(), StoreError>;

    /// All partitions, sorted oldest first.
    async fn partitions(&self) -> Result<Vec<String>, StoreError>;

    /// Every entry of a partition in append order.
    async fn read_partition(&self, partition: &str) -> Result<Vec<RawEntry>, StoreError>;
}
