//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use simbridge_audit::store::MemoryAuditStore;
use simbridge_audit::{AuditSink, AuditStore, EventFilter};
use simbridge_core::JobId;
use simbridge_infra::artifacts::InMemoryArtifactStore;
use simbridge_infra::jobs::{
    handler_fn, ExecutionBackend, ExecutionError, InProcessBackend, InMemoryJobRegistry,
    JobHandler, JobRegistry, RetryPolicy, Scheduler, SchedulerConfig,
};

pub struct Harness {
    pub scheduler: Scheduler,
    pub registry: Arc<dyn JobRegistry>,
    pub audit: Arc<AuditSink>,
    pub artifacts: Arc<InMemoryArtifactStore>,
}

impl Harness {
    pub async fn start(backend: InProcessBackend, workers: usize) -> Self {
        Self::start_with(Arc::new(InMemoryJobRegistry::new()), backend, workers).await
    }

    pub async fn start_with(
        registry: Arc<dyn JobRegistry>,
        backend: InProcessBackend,
        workers: usize,
    ) -> Self {
        Self::build(
            registry,
            Arc::new(backend),
            Arc::new(MemoryAuditStore::new()),
            config(workers),
        )
        .await
    }

    pub async fn build(
        registry: Arc<dyn JobRegistry>,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn AuditStore>,
        config: SchedulerConfig,
    ) -> Self {
        let audit = Arc::new(AuditSink::open(store).await.unwrap());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let scheduler = Scheduler::start(
            registry.clone(),
            backend,
            audit.clone(),
            artifacts.clone(),
            config,
        )
        .await
        .unwrap();
        Self {
            scheduler,
            registry,
            audit,
            artifacts,
        }
    }

    /// Event types recorded for `job_id`, oldest first.
    pub async fn job_events(&self, job_id: JobId) -> Vec<String> {
        let mut events = self
            .audit
            .fetch_events(100, &EventFilter::job(job_id))
            .await
            .unwrap();
        events.reverse();
        events.into_iter().map(|e| e.event_type).collect()
    }

    /// `status` field of each job event, oldest first.
    pub async fn job_statuses(&self, job_id: JobId) -> Vec<String> {
        let mut events = self
            .audit
            .fetch_events(100, &EventFilter::job(job_id))
            .await
            .unwrap();
        events.reverse();
        events
            .into_iter()
            .map(|e| e.payload["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

/// Scheduler settings used by the fixtures: `workers` dispatchers and a
/// short fixed backoff.
pub fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_workers(workers)
        .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(5)))
}

/// Handler that counts calls, fails transiently the first `failures` times
/// and then echoes its params.
pub fn flaky(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn JobHandler> {
    handler_fn(move |work| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(ExecutionError::Transient(format!("engine busy ({n})")))
            } else {
                Ok(json!({ "echo": work.params, "attempt": work.attempt }))
            }
        }
    })
}

/// Handler that sleeps for `delay` before returning.
pub fn sleeper(delay: Duration) -> Arc<dyn JobHandler> {
    handler_fn(move |_work| async move {
        tokio::time::sleep(delay).await;
        Ok::<Value, ExecutionError>(json!("done"))
    })
}

pub fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}
