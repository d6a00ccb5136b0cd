//! Per-record locks, sharded by job id.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

use simbridge_core::JobId;

const DEFAULT_SHARDS: usize = 64;

/// Serializes mutation of a job record.
///
/// Two ids may share a shard; that only costs throughput, never correctness.
/// Guards are async-aware so the owner may await registry and audit writes
/// while holding one.
#[derive(Debug)]
pub struct RecordLocks {
    shards: Vec<Mutex<()>>,
}

impl Default for RecordLocks {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl RecordLocks {
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard(&self, id: JobId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock(&self, id: JobId) -> MutexGuard<'_, ()> {
        self.shards[self.shard(id)].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = Arc::new(RecordLocks::with_shards(4));
        let id = JobId::new();

        let guard = locks.lock(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[test]
    fn shard_is_stable() {
        let locks = RecordLocks::default();
        let id = JobId::new();
        assert_eq!(locks.shard(id), locks.shard(id));
    }
}
