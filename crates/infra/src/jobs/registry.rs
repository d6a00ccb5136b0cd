//! Durable job registry abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simbridge_core::{BridgeError, JobId};

use super::types::{JobRecord, JobStatus};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RegistryError> for BridgeError {
    fn from(err: RegistryError) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

/// (tool, caller key) -> (request fingerprint, job id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tool: String,
    pub key: String,
    pub fingerprint: String,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Result of an atomic claim on an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The mapping was created by this call.
    Claimed,
    /// A mapping already existed.
    Existing(IdempotencyRecord),
}

/// Filter for [`JobRegistry::list`]. Results are ordered by `submitted_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub status: Option<JobStatus>,
    pub kind: Option<String>,
    /// Only records with `finished_at` strictly before this instant.
    pub finished_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn finished_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.finished_before = Some(cutoff);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.kind.as_deref().is_none_or(|k| record.kind == k)
            && self
                .finished_before
                .is_none_or(|cutoff| record.finished_at.is_some_and(|f| f < cutoff))
    }
}

/// Crash-tolerant store of job records and idempotency mappings.
///
/// `upsert` replaces the whole record atomically. Callers serialize writes to
/// a given record; the registry itself only guarantees per-call atomicity.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn upsert(&self, record: &JobRecord) -> Result<(), RegistryError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, RegistryError>;

    async fn list(&self, query: &RecordQuery) -> Result<Vec<JobRecord>, RegistryError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: JobId) -> Result<bool, RegistryError>;

    async fn idempotency_get(
        &self,
        tool: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, RegistryError>;

    /// Atomically create the mapping unless one exists for (tool, key).
    async fn idempotency_claim(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, RegistryError>;

    /// Remove every mapping pointing at `job_id`. Returns the count removed.
    async fn idempotency_delete_for_job(&self, job_id: JobId) -> Result<u64, RegistryError>;
}

/// In-memory registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    idempotency: RwLock<HashMap<(String, String), IdempotencyRecord>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> RegistryError {
    RegistryError::Storage("registry lock poisoned".to_string())
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn upsert(&self, record: &JobRecord) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, RegistryError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<JobRecord>, RegistryError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|r| query.matches(r)).cloned().collect();
        result.sort_by_key(|r| (r.submitted_at, r.id));
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn delete(&self, id: JobId) -> Result<bool, RegistryError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        Ok(jobs.remove(&id).is_some())
    }

    async fn idempotency_get(
        &self,
        tool: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, RegistryError> {
        let map = self.idempotency.read().map_err(|_| poisoned())?;
        Ok(map.get(&(tool.to_string(), key.to_string())).cloned())
    }

    async fn idempotency_claim(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, RegistryError> {
        let mut map = self.idempotency.write().map_err(|_| poisoned())?;
        let slot = (record.tool.clone(), record.key.clone());
        if let Some(existing) = map.get(&slot) {
            return Ok(ClaimOutcome::Existing(existing.clone()));
        }
        map.insert(slot, record.clone());
        Ok(ClaimOutcome::Claimed)
    }

    async fn idempotency_delete_for_job(&self, job_id: JobId) -> Result<u64, RegistryError> {
        let mut map = self.idempotency.write().map_err(|_| poisoned())?;
        let before = map.len();
        map.retain(|_, r| r.job_id != job_id);
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use simbridge_core::ErrorKind;

    use crate::jobs::types::JobError;

    fn record(kind: &str) -> JobRecord {
        JobRecord::new(JobId::new(), kind, json!({}), 10, 0, Utc::now())
    }

    #[tokio::test]
    async fn upsert_replaces_whole_record() {
        let reg = InMemoryJobRegistry::new();
        let mut r = record("sim.a");
        reg.upsert(&r).await.unwrap();
        r.mark_running(Utc::now()).unwrap();
        reg.upsert(&r).await.unwrap();

        let back = reg.get(r.id).await.unwrap().unwrap();
        assert_eq!(back.status, JobStatus::Running);
        assert_eq!(back.attempts, 1);
    }

    #[tokio::test]
    async fn list_filters_by_status_kind_and_finish_time() {
        let reg = InMemoryJobRegistry::new();
        let queued = record("sim.a");
        let mut failed = record("sim.b");
        failed.mark_running(Utc::now()).unwrap();
        failed
            .mark_failed(JobError::new(ErrorKind::PermanentFailure, "x"), Utc::now())
            .unwrap();
        reg.upsert(&queued).await.unwrap();
        reg.upsert(&failed).await.unwrap();

        let q = reg.list(&RecordQuery::status(JobStatus::Queued)).await.unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].id, queued.id);

        let by_kind = reg
            .list(&RecordQuery::default().with_kind("sim.b"))
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 1);

        let old = reg
            .list(&RecordQuery::default().finished_before(Utc::now() + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, failed.id);
    }

    #[tokio::test]
    async fn idempotency_claim_is_first_writer_wins() {
        let reg = InMemoryJobRegistry::new();
        let first = IdempotencyRecord {
            tool: "run_sim".into(),
            key: "k1".into(),
            fingerprint: "fp1".into(),
            job_id: JobId::new(),
            created_at: Utc::now(),
        };
        let second = IdempotencyRecord {
            job_id: JobId::new(),
            fingerprint: "fp2".into(),
            ..first.clone()
        };

        assert_eq!(reg.idempotency_claim(&first).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            reg.idempotency_claim(&second).await.unwrap(),
            ClaimOutcome::Existing(first.clone())
        );
        assert_eq!(reg.idempotency_delete_for_job(first.job_id).await.unwrap(), 1);
        assert!(reg.idempotency_get("run_sim", "k1").await.unwrap().is_none());
    }
}
