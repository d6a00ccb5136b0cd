//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use simbridge_core::{BridgeError, ErrorKind, JobId};

/// Job execution status.
///
/// ```text
/// QUEUED -> RUNNING -> { SUCCEEDED | FAILED | CANCELLED | TIMEOUT }
///    ^         |
///    +---------+  (retry)
/// QUEUED -> CANCELLED  (cancelled before start)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker (initially, or between retries)
    Queued,
    /// An attempt is executing
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Timeout,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Queued)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay applied between a transient failure and the next attempt.
///
/// How many retries a job gets is a property of the job (`max_retries`); the
/// policy only decides how long to wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Reference to a stored result artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRef {
    /// Artifact store key
    pub key: String,
    pub size_bytes: u64,
    /// SHA-256 of the stored bytes (hex)
    pub sha256: String,
}

/// Classified job error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to} for job {job_id}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl From<TransitionError> for BridgeError {
    fn from(err: TransitionError) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

/// Reason recorded when restart reconciliation fails an orphaned job.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Durable job record.
///
/// Invariants (enforced by the transition methods):
/// - `finished_at` is set iff the status is terminal
/// - `result` is set iff the status is `Succeeded`
/// - `attempts <= max_retries + 1` once terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub params: Value,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub cancel_requested: bool,
    pub result: Option<ResultRef>,
    pub error: Option<JobError>,
    pub idempotency_key: Option<String>,
    /// Handle in an external batch scheduler, when one ran the job.
    pub external_ref: Option<String>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        kind: impl Into<String>,
        params: Value,
        timeout_seconds: u64,
        max_retries: u32,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            params,
            status: JobStatus::Queued,
            submitted_at,
            started_at: None,
            finished_at: None,
            attempts: 0,
            max_retries,
            timeout_seconds,
            cancel_requested: false,
            result: None,
            error: None,
            idempotency_key: None,
            external_ref: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn finish(&mut self, to: JobStatus, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(to)?;
        self.finished_at = Some(at);
        Ok(())
    }

    /// Start an attempt.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
        Ok(())
    }

    /// Whether a transient failure of the current attempt may be retried.
    pub fn retry_allowed(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Back to the queue after a transient failure.
    pub fn mark_retry(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobStatus::Queued)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        result: ResultRef,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.finish(JobStatus::Succeeded, at)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: JobError, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish(JobStatus::Failed, at)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish(JobStatus::Cancelled, at)?;
        self.error = Some(JobError::new(ErrorKind::Cancelled, "cancelled on request"));
        Ok(())
    }

    pub fn mark_timed_out(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish(JobStatus::Timeout, at)?;
        self.error = Some(JobError::new(
            ErrorKind::Timeout,
            format!("exceeded timeout of {}s", self.timeout_seconds),
        ));
        Ok(())
    }

    /// Fail a record left RUNNING by a previous process.
    pub fn mark_interrupted_by_restart(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.mark_failed(
            JobError::new(ErrorKind::InterruptedByRestart, INTERRUPTED_BY_RESTART),
            at,
        )
    }
}

/// Caller-facing projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub kind: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub result: Option<ResultRef>,
    pub error: Option<JobError>,
    pub cancel_requested: bool,
    pub external_ref: Option<String>,
}

impl From<&JobRecord> for JobView {
    fn from(r: &JobRecord) -> Self {
        Self {
            job_id: r.id,
            kind: r.kind.clone(),
            status: r.status,
            submitted_at: r.submitted_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            attempts: r.attempts,
            max_retries: r.max_retries,
            timeout_seconds: r.timeout_seconds,
            result: r.result.clone(),
            error: r.error.clone(),
            cancel_requested: r.cancel_requested,
            external_ref: r.external_ref.clone(),
        }
    }
}

/// Response to a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    /// True when an idempotent resubmission resolved to an existing job.
    pub replayed: bool,
}

impl SubmitReceipt {
    pub fn for_record(record: &JobRecord, replayed: bool) -> Self {
        Self {
            job_id: record.id,
            status: record.status,
            queued_at: record.submitted_at,
            timeout_seconds: record.timeout_seconds,
            max_retries: record.max_retries,
            replayed,
        }
    }
}

/// Per-submission options. Unset values fall back to scheduler defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub idempotency_key: Option<String>,
    /// Request fingerprint; computed from kind and params when absent.
    pub fingerprint: Option<String>,
    /// Idempotency namespace; defaults to the job kind.
    pub tool: Option<String>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}
