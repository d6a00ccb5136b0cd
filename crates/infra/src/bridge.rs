//! Service wiring: builds every component from a [`BridgeConfig`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use simbridge_audit::store::{
    FsObjectStore, LocalFileStore, MemoryAuditStore, ObjectAuditStore, RetentionLock,
};
use simbridge_audit::{AuditSink, AuditStore, RetentionPolicy};
use simbridge_core::BridgeError;

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::config::{AuditBackend, BridgeConfig, RegistryBackend};
use crate::idempotency::IdempotencyGate;
use crate::jobs::backend::ExecutionBackend;
use crate::jobs::registry::{InMemoryJobRegistry, JobRegistry};
use crate::jobs::scheduler::Scheduler;
use crate::jobs::sqlite::SqliteJobRegistry;
use crate::workers::{RetentionSweeper, VerificationTask, WorkerHandle};

/// A running bridge: scheduler, idempotency gate, audit sink and the
/// background maintenance workers.
pub struct Bridge {
    scheduler: Scheduler,
    gate: IdempotencyGate,
    audit: Arc<AuditSink>,
    workers: Vec<WorkerHandle>,
}

impl Bridge {
    pub async fn start(
        config: BridgeConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self, BridgeError> {
        let registry: Arc<dyn JobRegistry> = match config.registry.backend {
            RegistryBackend::Sqlite => Arc::new(SqliteJobRegistry::open(&config.registry.path).await?),
            RegistryBackend::Memory => Arc::new(InMemoryJobRegistry::new()),
        };

        let audit = Arc::new(open_audit(&config).await?);
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::open(&config.artifacts.path).await?);

        let scheduler = Scheduler::start(
            registry.clone(),
            backend,
            audit.clone(),
            artifacts.clone(),
            config.scheduler.scheduler_config(),
        )
        .await?;
        let gate = IdempotencyGate::new(scheduler.clone(), audit.clone());

        let sweeper = RetentionSweeper::new(
            registry,
            artifacts,
            audit.clone(),
            Duration::from_secs(config.retention.retention_seconds),
        )
        .spawn(Duration::from_secs(config.retention.sweep_interval_seconds));
        let verifier = VerificationTask::new(audit.clone(), config.audit.verify_lookback_days)
            .spawn(Duration::from_secs(config.audit.verify_interval_seconds));

        info!(
            registry = ?config.registry.backend,
            audit = %audit.store().describe(),
            "bridge started"
        );
        Ok(Self {
            scheduler,
            gate,
            audit,
            workers: vec![sweeper, verifier],
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn gate(&self) -> &IdempotencyGate {
        &self.gate
    }

    pub fn audit(&self) -> &Arc<AuditSink> {
        &self.audit
    }

    pub async fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown().await;
        }
        self.scheduler.shutdown().await;
        info!("bridge stopped");
    }
}

async fn open_audit(config: &BridgeConfig) -> Result<AuditSink, BridgeError> {
    let settings = &config.audit;
    let store: Arc<dyn AuditStore> = match settings.backend {
        AuditBackend::Local => Arc::new(
            LocalFileStore::open(&settings.path)
                .await
                .map_err(|e| BridgeError::internal(format!("audit store: {e}")))?,
        ),
        AuditBackend::Object => {
            let mut store = ObjectAuditStore::new(
                FsObjectStore::new(&settings.path),
                settings.object_prefix.clone(),
            );
            if let Some(mode) = settings.retention_mode {
                store = store.with_retention_lock(RetentionLock {
                    mode,
                    days: settings.retention_days,
                });
            }
            Arc::new(store)
        }
        AuditBackend::Memory => Arc::new(MemoryAuditStore::new()),
    };

    let mut sink = AuditSink::open(store).await?;
    if let Some(mode) = settings.retention_mode {
        sink = sink.with_retention_policy(RetentionPolicy {
            mode,
            min_days: settings.retention_days,
        });
    }
    Ok(sink)
}
