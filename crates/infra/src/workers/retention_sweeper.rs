//! Retention sweeper: prunes terminal jobs past the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use simbridge_audit::AuditSink;
use simbridge_core::{time, BridgeError};

use super::WorkerHandle;
use crate::artifacts::ArtifactStore;
use crate::jobs::registry::{JobRegistry, RecordQuery};
use crate::jobs::types::{JobRecord, JobStatus};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired records found
    pub scanned: usize,
    pub deleted: usize,
    pub artifacts_deleted: usize,
    pub mappings_deleted: u64,
    /// Records that could not be purged this round
    pub errors: usize,
}

/// Deletes terminal records whose `finished_at` is older than the retention
/// window, together with their idempotency mappings and result artifacts.
///
/// Non-terminal records are never touched. Terminal records are immutable,
/// so sweeping needs no coordination with the scheduler, and a purge
/// interrupted halfway is completed by the next sweep.
pub struct RetentionSweeper {
    registry: Arc<dyn JobRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    audit: Arc<AuditSink>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        audit: Arc<AuditSink>,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            artifacts,
            audit,
            retention,
        }
    }

    /// Sweep once, treating `now` as the current time.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, BridgeError> {
        let mut report = SweepReport::default();
        let Some(cutoff) = TimeDelta::from_std(self.retention)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(report);
        };

        for status in JobStatus::TERMINAL {
            let expired = self
                .registry
                .list(&RecordQuery::status(status).finished_before(cutoff))
                .await?;
            report.scanned += expired.len();

            for record in expired {
                match self.purge(&record).await {
                    Ok((mappings, artifact)) => {
                        report.deleted += 1;
                        report.mappings_deleted += mappings;
                        report.artifacts_deleted += usize::from(artifact);
                        debug!(job_id = %record.id, status = %record.status, "expired job purged");
                    }
                    Err(e) => {
                        report.errors += 1;
                        warn!(job_id = %record.id, error = %e, "failed to purge expired job");
                    }
                }
            }
        }

        if report.deleted > 0 {
            self.audit
                .record_event(
                    "retention.swept",
                    json!({
                        "cutoff": time::format(cutoff),
                        "deleted": report.deleted,
                        "artifacts_deleted": report.artifacts_deleted,
                        "mappings_deleted": report.mappings_deleted,
                    }),
                )
                .await?;
            info!(deleted = report.deleted, artifacts = report.artifacts_deleted, "retention sweep complete");
        }
        Ok(report)
    }

    /// Mapping first, then record, then artifact: a partial purge never
    /// leaves a mapping pointing at a missing record.
    async fn purge(&self, record: &JobRecord) -> Result<(u64, bool), BridgeError> {
        let mappings = self.registry.idempotency_delete_for_job(record.id).await?;
        self.registry.delete(record.id).await?;
        let artifact = match &record.result {
            Some(result) => self.artifacts.delete(&result.key).await?,
            None => false,
        };
        Ok((mappings, artifact))
    }

    /// Run [`RetentionSweeper::sweep_once`] every `interval`.
    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(retention_secs = self.retention.as_secs(), "retention sweeper started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once(time::now()).await {
                            error!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
            info!("retention sweeper stopped");
        });
        WorkerHandle::new("retention-sweeper", shutdown, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use simbridge_audit::store::MemoryAuditStore;
    use simbridge_core::JobId;

    use crate::artifacts::InMemoryArtifactStore;
    use crate::jobs::registry::{IdempotencyRecord, InMemoryJobRegistry};

    struct Fixture {
        registry: Arc<InMemoryJobRegistry>,
        artifacts: Arc<InMemoryArtifactStore>,
        sweeper: RetentionSweeper,
    }

    async fn fixture(retention: Duration) -> Fixture {
        let registry = Arc::new(InMemoryJobRegistry::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let audit = Arc::new(
            AuditSink::open(Arc::new(MemoryAuditStore::new()))
                .await
                .unwrap(),
        );
        let sweeper = RetentionSweeper::new(registry.clone(), artifacts.clone(), audit, retention);
        Fixture {
            registry,
            artifacts,
            sweeper,
        }
    }

    async fn succeeded_job(f: &Fixture, finished_at: DateTime<Utc>) -> JobRecord {
        let mut r = JobRecord::new(JobId::new(), "sim.a", json!({}), 5, 0, finished_at)
            .with_idempotency_key(Some("k".into()));
        r.mark_running(finished_at).unwrap();
        let result = f.artifacts.put(r.id, &json!({"ok": true})).await.unwrap();
        r.mark_succeeded(result, finished_at).unwrap();
        f.registry.upsert(&r).await.unwrap();
        f.registry
            .idempotency_claim(&IdempotencyRecord {
                tool: "sim.a".into(),
                key: r.id.to_string(),
                fingerprint: "fp".into(),
                job_id: r.id,
                created_at: finished_at,
            })
            .await
            .unwrap();
        r
    }

    #[tokio::test]
    async fn purges_expired_terminal_jobs_only() {
        let f = fixture(Duration::from_secs(60)).await;
        let now = time::now();
        let old = succeeded_job(&f, now - TimeDelta::seconds(120)).await;
        let fresh = succeeded_job(&f, now - TimeDelta::seconds(10)).await;
        let queued = JobRecord::new(JobId::new(), "sim.a", json!({}), 5, 0, now - TimeDelta::days(3));
        f.registry.upsert(&queued).await.unwrap();

        let report = f.sweeper.sweep_once(now).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.artifacts_deleted, 1);
        assert_eq!(report.mappings_deleted, 1);
        assert_eq!(report.errors, 0);

        assert!(f.registry.get(old.id).await.unwrap().is_none());
        assert!(f.registry.idempotency_get("sim.a", &old.id.to_string()).await.unwrap().is_none());
        assert!(f.registry.get(fresh.id).await.unwrap().is_some());
        assert!(f.registry.get(queued.id).await.unwrap().is_some());
        assert_eq!(f.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let f = fixture(Duration::from_secs(1)).await;
        let now = time::now();
        succeeded_job(&f, now - TimeDelta::seconds(5)).await;

        assert_eq!(f.sweeper.sweep_once(now).await.unwrap().deleted, 1);
        assert_eq!(f.sweeper.sweep_once(now).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let f = fixture(Duration::from_secs(1)).await;
        succeeded_job(&f, time::now() - TimeDelta::seconds(5)).await;
        let registry = f.registry.clone();

        let handle = f.sweeper.spawn(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert!(registry.list(&RecordQuery::default()).await.unwrap().is_empty());
    }
}
