use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{AuditStore, RawEntry, StoreError};
use crate::event::AuditEvent;

/// In-memory audit store for tests/dev.
///
/// Entries are kept as serialized bytes so verification exercises the same
/// decode path as the on-disk stores.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    partitions: RwLock<BTreeMap<String, Vec<Vec<u8>>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events.
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .map(|p| p.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::io(
            "memory",
            std::io::Error::other("audit store lock poisoned"),
        )
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    async fn append(&self, partition: &str, event: &AuditEvent) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(event)?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        partitions.entry(partition.to_string()).or_default().push(bytes);
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<String>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        Ok(partitions.keys().cloned().collect())
    }

    async fn read_partition(&self, partition: &str) -> Result<Vec<RawEntry>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        let entries = partitions
            .get(partition)
            .map(|entries| {
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, bytes)| RawEntry {
                        offset: i as u64,
                        locator: format!("memory:{partition}#{i}"),
                        bytes: bytes.clone(),
                        retention: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }
}
