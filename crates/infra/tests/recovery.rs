//! Restart reconciliation and retention against a durable registry.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde_json::json;

use simbridge_core::{time, ErrorKind, JobId};
use simbridge_infra::jobs::types::INTERRUPTED_BY_RESTART;
use simbridge_infra::jobs::{
    InProcessBackend, JobRecord, JobRegistry, JobStatus, SqliteJobRegistry, SubmitOptions,
};
use simbridge_infra::RetentionSweeper;

use common::{counter, flaky, Harness};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn restart_fails_running_jobs_and_resumes_queued_ones() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    // State left behind by a process that died mid-flight.
    let (orphan, pending) = {
        let registry = SqliteJobRegistry::open(&db).await.unwrap();
        let mut orphan = JobRecord::new(JobId::new(), "sim.a", json!({}), 60, 2, time::now());
        orphan.mark_running(time::now()).unwrap();
        let pending = JobRecord::new(JobId::new(), "sim.a", json!({"n": 1}), 60, 0, time::now());
        registry.upsert(&orphan).await.unwrap();
        registry.upsert(&pending).await.unwrap();
        (orphan, pending)
    };

    let calls = counter();
    let registry = Arc::new(SqliteJobRegistry::open(&db).await.unwrap());
    let h = Harness::start_with(
        registry,
        InProcessBackend::new().with_handler("sim.*", flaky(0, calls.clone())),
        2,
    )
    .await;

    let failed = h.scheduler.get(orphan.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.finished_at.is_some());
    let error = failed.error.unwrap();
    assert_eq!(error.kind, ErrorKind::InterruptedByRestart);
    assert_eq!(error.message, INTERRUPTED_BY_RESTART);
    assert_eq!(h.job_events(orphan.id).await, vec!["job.sim.a.failed"]);

    let resumed = h.scheduler.wait(pending.id, WAIT).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn records_survive_a_scheduler_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    let job_id = {
        let registry = Arc::new(SqliteJobRegistry::open(&db).await.unwrap());
        let h = Harness::start_with(
            registry,
            InProcessBackend::new().with_handler("sim.*", flaky(0, counter())),
            1,
        )
        .await;
        let receipt = h
            .scheduler
            .submit("sim.a", json!({}), SubmitOptions::new().idempotency_key("once"))
            .await
            .unwrap();
        h.scheduler.wait(receipt.job_id, WAIT).await.unwrap();
        h.scheduler.shutdown().await;
        receipt.job_id
    };

    let calls = counter();
    let registry = Arc::new(SqliteJobRegistry::open(&db).await.unwrap());
    let h = Harness::start_with(
        registry,
        InProcessBackend::new().with_handler("sim.*", flaky(0, calls.clone())),
        1,
    )
    .await;

    assert_eq!(h.scheduler.get(job_id).await.unwrap().status, JobStatus::Succeeded);
    let replay = h
        .scheduler
        .submit("sim.a", json!({}), SubmitOptions::new().idempotency_key("once"))
        .await
        .unwrap();
    assert_eq!(replay.job_id, job_id);
    assert!(replay.replayed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retention_removes_expired_jobs_and_frees_their_keys() {
    let h = Harness::start(
        InProcessBackend::new().with_handler("sim.*", flaky(0, counter())),
        1,
    )
    .await;

    let done = h
        .scheduler
        .submit("sim.a", json!({"v": 1}), SubmitOptions::new().idempotency_key("k"))
        .await
        .unwrap();
    h.scheduler.wait(done.job_id, WAIT).await.unwrap();
    assert_eq!(h.artifacts.len(), 1);

    let sweeper = RetentionSweeper::new(
        h.registry.clone(),
        h.artifacts.clone(),
        h.audit.clone(),
        Duration::from_secs(60),
    );

    // Within the window nothing is touched.
    assert_eq!(sweeper.sweep_once(time::now()).await.unwrap().deleted, 0);

    let later = time::now() + TimeDelta::seconds(120);
    let report = sweeper.sweep_once(later).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.artifacts_deleted, 1);
    assert_eq!(report.mappings_deleted, 1);

    assert_eq!(
        h.scheduler.get(done.job_id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(h.artifacts.is_empty());

    // The key is free again: a different request under it is a new job.
    let fresh = h
        .scheduler
        .submit("sim.a", json!({"v": 2}), SubmitOptions::new().idempotency_key("k"))
        .await
        .unwrap();
    assert_ne!(fresh.job_id, done.job_id);
    assert!(!fresh.replayed);

    let swept = h
        .audit
        .fetch_events(1, &simbridge_audit::EventFilter::event_type("retention."))
        .await
        .unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].payload["deleted"], 1);
}
