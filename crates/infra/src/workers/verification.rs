//! Scheduled audit chain verification.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use simbridge_audit::{AuditError, AuditSink, VerifyRange, VerifyReport};
use simbridge_core::time;

use super::WorkerHandle;

/// Verifies the most recent `lookback_days` partitions of the chain.
pub struct VerificationTask {
    audit: Arc<AuditSink>,
    lookback_days: u32,
}

impl VerificationTask {
    pub fn new(audit: Arc<AuditSink>, lookback_days: u32) -> Self {
        Self {
            audit,
            lookback_days,
        }
    }

    pub fn range_for(&self, today: NaiveDate) -> VerifyRange {
        let from = today
            .checked_sub_days(Days::new(u64::from(self.lookback_days)))
            .unwrap_or(NaiveDate::MIN);
        VerifyRange::between(Some(from), Some(today))
    }

    pub async fn run_once(&self, today: NaiveDate) -> Result<VerifyReport, AuditError> {
        self.audit.verify(self.range_for(today)).await
    }

    /// Verify every `interval`. Failures are logged; integrity failures are
    /// also logged by the sink with their location.
    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(lookback_days = self.lookback_days, "audit verification task started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let today = time::now().date_naive();
                        match self.run_once(today).await {
                            Ok(report) if !report.ok => {
                                error!(checked = report.checked, "scheduled audit verification found a broken chain");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "scheduled audit verification failed to run"),
                        }
                    }
                }
            }
            info!("audit verification task stopped");
        });
        WorkerHandle::new("audit-verification", shutdown, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use simbridge_audit::store::MemoryAuditStore;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn range_covers_lookback_window() {
        let audit = Arc::new(AuditSink::open(Arc::new(MemoryAuditStore::new())).await.unwrap());
        let task = VerificationTask::new(audit, 7);
        let range = task.range_for(day("2026-03-10"));
        assert_eq!(range.from, Some(day("2026-03-03")));
        assert_eq!(range.to, Some(day("2026-03-10")));
    }

    #[tokio::test]
    async fn verifies_recent_events() {
        let audit = Arc::new(AuditSink::open(Arc::new(MemoryAuditStore::new())).await.unwrap());
        for i in 0..3 {
            audit.record_event("job.sim.a.queued", json!({ "i": i })).await.unwrap();
        }
        let task = VerificationTask::new(audit, 1);
        let report = task.run_once(time::now().date_naive()).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 3);
    }
}
