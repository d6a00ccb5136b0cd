//! The audit sink: single writer of the hash chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use simbridge_core::{time, EventId, JobId};

use crate::error::AuditError;
use crate::event::{partition_for, AuditEvent, ZERO_HASH};
use crate::redact;
use crate::store::AuditStore;
use crate::verify::{last_stored_entry, verify_store, RetentionPolicy, VerifyRange, VerifyReport};

/// Filter for [`AuditSink::fetch_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Keep events whose type starts with this prefix (e.g. `"job."`).
    pub event_type_prefix: Option<String>,
    /// Keep events whose payload carries this `job_id`.
    pub job_id: Option<JobId>,
    /// Keep events at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn event_type(prefix: impl Into<String>) -> Self {
        Self {
            event_type_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(prefix) = &self.event_type_prefix {
            if !event.event_type.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(job_id) = self.job_id {
            let wanted = job_id.to_string();
            if event.payload.get("job_id").and_then(Value::as_str) != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct ChainState {
    partition: Option<String>,
    tail: String,
    halted: Option<String>,
}

/// Append-only hash-chain writer.
///
/// Every write happens under one lock: the event is sealed against the current
/// tail hash, stored, and only then does the tail advance. If the store fails
/// the sink halts and every later write returns [`AuditError::Halted`], so a
/// gap in the chain is never papered over.
pub struct AuditSink {
    store: Arc<dyn AuditStore>,
    state: Mutex<ChainState>,
    retention_policy: Option<RetentionPolicy>,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("store", &self.store.describe())
            .finish_non_exhaustive()
    }
}

impl AuditSink {
    /// Open a sink, recovering the chain tail from the newest stored event.
    ///
    /// Fails with [`AuditError::Integrity`] if the newest event is unreadable
    /// or does not match its own hash; appending after a corrupt tail would
    /// only extend a chain that can no longer verify.
    pub async fn open(store: Arc<dyn AuditStore>) -> Result<Self, AuditError> {
        let partitions = store.partitions().await?;
        let mut state = ChainState {
            partition: None,
            tail: ZERO_HASH.to_string(),
            halted: None,
        };

        if let Some((partition, last)) =
            last_stored_entry(store.as_ref(), partitions.iter()).await?
        {
            let event: AuditEvent = serde_json::from_slice(&last.bytes).map_err(|e| {
                AuditError::Integrity(format!("unreadable tail at {}: {e}", last.locator))
            })?;
            if event.compute_hash()? != event.hash {
                return Err(AuditError::Integrity(format!(
                    "tail event {} at {} does not match its hash",
                    event.event_id, last.locator
                )));
            }
            debug!(partition = %partition, "chain tail recovered");
            state.tail = event.hash;
        }
        // Partitions never move backwards, even past an empty newest one.
        state.partition = partitions.last().cloned();

        info!(
            store = %store.describe(),
            partition = ?state.partition,
            tail = %state.tail,
            "audit sink opened"
        );

        Ok(Self {
            store,
            state: Mutex::new(state),
            retention_policy: None,
        })
    }

    /// Retention requirements checked by [`AuditSink::verify`].
    pub fn with_retention_policy(mut self, policy: RetentionPolicy) -> Self {
        self.retention_policy = Some(policy);
        self
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Current tail hash.
    pub async fn tail_hash(&self) -> String {
        self.state.lock().await.tail.clone()
    }

    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted.is_some()
    }

    /// Seal and append an event stamped with the current time.
    pub async fn record_event(
        &self,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<AuditEvent, AuditError> {
        self.record_event_at(event_type, payload, time::now()).await
    }

    /// Seal and append an event with an explicit timestamp.
    ///
    /// Partitions never move backwards: an event stamped before the active
    /// partition's day is written into the active partition.
    pub async fn record_event_at(
        &self,
        event_type: impl Into<String>,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<AuditEvent, AuditError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.halted {
            return Err(AuditError::Halted(reason.clone()));
        }

        let mut partition = partition_for(timestamp);
        if let Some(active) = &state.partition {
            if partition < *active {
                partition = active.clone();
            } else if partition > *active {
                debug!(from = %active, to = %partition, "audit partition rotated");
            }
        }

        let event = AuditEvent::seal(
            EventId::new(),
            timestamp,
            event_type,
            payload,
            state.tail.clone(),
        )?;

        if let Err(e) = self.store.append(&partition, &event).await {
            error!(
                store = %self.store.describe(),
                partition = %partition,
                event_type = %event.event_type,
                error = %e,
                "audit write failed, halting sink"
            );
            state.halted = Some(e.to_string());
            return Err(AuditError::Store(e));
        }

        state.tail = event.hash.clone();
        state.partition = Some(partition);
        Ok(event)
    }

    /// Record an HTTP-layer entry after scrubbing secret-looking values.
    pub async fn record_http_event(
        &self,
        event_type: impl Into<String>,
        mut payload: Value,
    ) -> Result<AuditEvent, AuditError> {
        let redacted = redact::scrub(&mut payload);
        if redacted > 0 {
            debug!(redacted, "scrubbed http audit payload");
        }
        self.record_event(event_type, payload).await
    }

    /// Most recent matching events, newest first.
    ///
    /// Write-once backends cannot list cheaply and return
    /// [`AuditError::Unsupported`].
    pub async fn fetch_events(
        &self,
        limit: usize,
        filter: &EventFilter,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        if !self.store.supports_random_access() {
            return Err(AuditError::Unsupported {
                backend: self.store.describe(),
                operation: "fetch_events",
            });
        }
        fetch_from_store(self.store.as_ref(), limit, filter).await
    }

    /// Verify the chain over `range`.
    ///
    /// Holds the writer lock for the duration so a half-written entry is
    /// never mistaken for corruption.
    pub async fn verify(&self, range: VerifyRange) -> Result<VerifyReport, AuditError> {
        let _writer = self.state.lock().await;
        let report =
            verify_store(self.store.as_ref(), range, self.retention_policy.as_ref()).await?;
        match &report.failure {
            Some(failure) => warn!(checked = report.checked, failure = %failure, "audit chain verification failed"),
            None => info!(checked = report.checked, partitions = report.partitions, "audit chain verified"),
        }
        Ok(report)
    }
}

/// Scan a random-access store for recent matching events, newest first.
pub async fn fetch_from_store(
    store: &dyn AuditStore,
    limit: usize,
    filter: &EventFilter,
) -> Result<Vec<AuditEvent>, AuditError> {
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }

    let since_partition = filter.since.map(partition_for);
    for partition in store.partitions().await?.iter().rev() {
        if since_partition.as_ref().is_some_and(|s| partition < s) {
            break;
        }
        let entries = store.read_partition(partition).await?;
        for entry in entries.iter().rev() {
            let event: AuditEvent = match serde_json::from_slice(&entry.bytes) {
                Ok(e) => e,
                Err(e) => {
                    warn!(locator = %entry.locator, error = %e, "skipping unreadable audit entry");
                    continue;
                }
            };
            if filter.matches(&event) {
                out.push(event);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
    }
    Ok(out)
}
