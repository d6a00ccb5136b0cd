//! Hand-off to an external batch scheduler.
//!
//! The job body is submitted to the external system and polled until it
//! reports a final state. The scheduler still owns the record; this backend
//! only relays status and the external reference.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{ExecutionBackend, ExecutionError, ExecutionOutput, WorkItem};

/// State reported by the external scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchState {
    Pending,
    Running,
    Completed(Value),
    Failed { message: String, retryable: bool },
}

/// Client for an external batch system (Slurm, PBS, a cloud batch API, ...).
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submit the work; returns the external job reference.
    async fn submit(&self, work: &WorkItem) -> Result<String, ExecutionError>;

    async fn poll(&self, external_ref: &str) -> Result<BatchState, ExecutionError>;

    /// Best-effort cancellation of a submitted job.
    async fn cancel(&self, external_ref: &str) -> Result<(), ExecutionError>;
}

/// [`ExecutionBackend`] that relays to a [`BatchClient`].
pub struct BatchHandoffBackend<C: BatchClient> {
    client: C,
    kinds: Vec<String>,
    poll_interval: Duration,
}

impl<C: BatchClient> BatchHandoffBackend<C> {
    /// `kinds` lists accepted kinds; `"prefix.*"` and `"*"` patterns work as
    /// in the in-process backend.
    pub fn new(client: C, kinds: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            client,
            kinds,
            poll_interval,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

fn pattern_matches(pattern: &str, kind: &str) -> bool {
    if pattern == "*" || pattern == kind {
        return true;
    }
    pattern
        .strip_suffix(".*")
        .and_then(|prefix| kind.strip_prefix(prefix))
        .is_some_and(|rest| rest.starts_with('.'))
}

#[async_trait]
impl<C: BatchClient> ExecutionBackend for BatchHandoffBackend<C> {
    fn name(&self) -> &str {
        "batch-handoff"
    }

    fn accepts(&self, kind: &str) -> bool {
        self.kinds.iter().any(|p| pattern_matches(p, kind))
    }

    async fn run(
        &self,
        work: WorkItem,
        interrupt: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let external_ref = self.client.submit(&work).await?;
        info!(job_id = %work.job_id, external_ref = %external_ref, attempt = work.attempt, "handed job to batch scheduler");

        loop {
            match self.client.poll(&external_ref).await? {
                BatchState::Completed(value) => {
                    return Ok(ExecutionOutput {
                        value,
                        external_ref: Some(external_ref),
                    });
                }
                BatchState::Failed { message, retryable } => {
                    return Err(if retryable {
                        ExecutionError::Transient(format!("{external_ref}: {message}"))
                    } else {
                        ExecutionError::Permanent(format!("{external_ref}: {message}"))
                    });
                }
                BatchState::Pending | BatchState::Running => {
                    debug!(job_id = %work.job_id, external_ref = %external_ref, "batch job still running");
                }
            }

            tokio::select! {
                _ = interrupt.cancelled() => {
                    if let Err(e) = self.client.cancel(&external_ref).await {
                        warn!(job_id = %work.job_id, external_ref = %external_ref, error = %e, "batch cancel failed");
                    }
                    return Err(ExecutionError::Interrupted);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
